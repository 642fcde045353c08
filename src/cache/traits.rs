//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;

use super::entry::{CacheEntry, CacheKey};
use crate::error::SyncError;

/// Durable byte storage behind the `LocalStore`.
///
/// Implementations are synchronous; the store calls them on every
/// `put`/`delete` and once at startup to hydrate.
pub trait Persistence: Send + Sync {
  /// Read the serialized entry for a key.
  fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

  /// Write the serialized entry for a key, replacing any previous row.
  fn write(&self, key: &CacheKey, bytes: &[u8]) -> Result<()>;

  /// Remove the row for a key. Removing an absent key is not an error.
  fn remove(&self, key: &CacheKey) -> Result<()>;

  /// Every key currently persisted.
  fn keys(&self) -> Result<Vec<CacheKey>>;

  /// Read a small named value kept next to the entries (e.g. the logged-in user).
  fn read_setting(&self, name: &str) -> Result<Option<String>>;

  /// Store a named value, or remove it with `None`.
  fn write_setting(&self, name: &str, value: Option<&str>) -> Result<()>;
}

/// Result from a read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The entity payload
  pub data: Value,
  /// Version of the entry the payload came from
  pub version: u64,
  /// Where the data came from
  pub source: CacheSource,
  /// When the entry was last confirmed against the server
  pub cached_at: DateTime<Utc>,
  /// Why a stale copy was served, if it was
  pub stale_reason: Option<SyncError>,
}

impl CacheResult {
  /// Fresh data that just came back from the network.
  pub fn from_network(entry: &CacheEntry) -> Self {
    Self::with_source(entry, CacheSource::Network)
  }

  /// Data served from cache inside its freshness window.
  pub fn from_cache(entry: &CacheEntry) -> Self {
    Self::with_source(entry, CacheSource::CacheFresh)
  }

  /// Stale data served because the network could not be reached.
  pub fn stale(entry: &CacheEntry, reason: SyncError) -> Self {
    Self {
      stale_reason: Some(reason),
      ..Self::with_source(entry, CacheSource::CacheStale)
    }
  }

  fn with_source(entry: &CacheEntry, source: CacheSource) -> Self {
    Self {
      data: entry.payload.clone(),
      version: entry.version,
      source,
      cached_at: entry.fetched_at,
      stale_reason: None,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }

  /// Refuse stale data, turning it into `SyncError::StaleData`.
  pub fn into_fresh(self) -> Result<Value, SyncError> {
    match (self.source, self.stale_reason) {
      (CacheSource::CacheStale, Some(reason)) => Err(SyncError::StaleData {
        key: reason.key().clone(),
        fetched_at: self.cached_at,
      }),
      _ => Ok(self.data),
    }
  }
}

/// Entries of a listed collection.
#[derive(Debug, Clone)]
pub struct ListResult {
  /// Entries in server order, or ordered by id when served from cache
  pub entries: Vec<CacheEntry>,
  pub source: CacheSource,
  /// Why cached entries were served, if they were
  pub stale_reason: Option<SyncError>,
}

impl ListResult {
  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache after the network failed
  CacheStale,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::CacheStale => "stale",
    }
  }
}
