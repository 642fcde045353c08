//! Cache keys and entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Entity families the field app reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
  User,
  Project,
  Report,
}

impl EntityType {
  pub const ALL: [EntityType; 3] = [EntityType::User, EntityType::Project, EntityType::Report];

  pub fn as_str(&self) -> &'static str {
    match self {
      EntityType::User => "user",
      EntityType::Project => "project",
      EntityType::Report => "report",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "user" | "users" | "usuario" => Ok(EntityType::User),
      "project" | "projects" | "proyecto" => Ok(EntityType::Project),
      "report" | "reports" | "reporte" => Ok(EntityType::Report),
      other => Err(format!("unknown entity type '{}'", other)),
    }
  }
}

/// Lookup handle for a cached entity, e.g. `report:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
  pub entity_type: EntityType,
  pub id: String,
}

impl CacheKey {
  pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
    Self {
      entity_type,
      id: id.into(),
    }
  }

  pub fn user(id: impl Into<String>) -> Self {
    Self::new(EntityType::User, id)
  }

  pub fn project(id: impl Into<String>) -> Self {
    Self::new(EntityType::Project, id)
  }

  pub fn report(id: impl Into<String>) -> Self {
    Self::new(EntityType::Report, id)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.entity_type, self.id)
  }
}

impl FromStr for CacheKey {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, id) = s
      .split_once(':')
      .ok_or_else(|| format!("expected <type>:<id>, got '{}'", s))?;
    if id.is_empty() {
      return Err(format!("missing id in '{}'", s));
    }
    Ok(Self::new(kind.parse()?, id))
  }
}

/// Lifecycle state of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
  /// Confirmed by the server within the freshness window
  Fresh,
  /// Last refresh failed; payload is the most recent known copy
  Stale,
  /// Optimistic local write awaiting server confirmation
  Pending,
  /// Last write was rejected and rolled back
  Error,
}

/// A single cached entity with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub payload: Value,
  pub version: u64,
  pub fetched_at: DateTime<Utc>,
  pub ttl_ms: u64,
  pub state: EntryState,
}

impl CacheEntry {
  pub fn new(key: CacheKey, payload: Value, version: u64, ttl_ms: u64) -> Self {
    Self {
      key,
      payload,
      version,
      fetched_at: Utc::now(),
      ttl_ms,
      state: EntryState::Fresh,
    }
  }

  pub fn with_state(mut self, state: EntryState) -> Self {
    self.state = state;
    self
  }

  /// Age of the entry relative to `now`, clamped at zero.
  pub fn age_at(&self, now: DateTime<Utc>) -> std::time::Duration {
    (now - self.fetched_at).to_std().unwrap_or_default()
  }

  /// Fresh entries younger than `max_age` can be served without a network call.
  pub fn is_servable(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> bool {
    self.state == EntryState::Fresh && self.age_at(now) < max_age
  }

  pub fn ttl(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.ttl_ms)
  }
}
