//! Network boundary: the server is the source of truth for every entity.

mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheEntry, CacheKey, EntityType};
use crate::error::SyncResult;

pub use http::HttpRemote;

/// Payload member linking a report to its project.
pub const PROJECT_REF: &str = "proyectoId";

/// A server-confirmed entity and its version.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
  pub payload: Value,
  pub version: u64,
}

impl RemoteRecord {
  pub fn new(payload: Value, version: u64) -> Self {
    Self { payload, version }
  }
}

/// Which collection to list: every entity of a type, or one project's reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
  pub entity_type: EntityType,
  pub project_id: Option<String>,
}

impl ListQuery {
  pub fn all(entity_type: EntityType) -> Self {
    Self {
      entity_type,
      project_id: None,
    }
  }

  pub fn reports_for_project(project_id: impl Into<String>) -> Self {
    Self {
      entity_type: EntityType::Report,
      project_id: Some(project_id.into()),
    }
  }

  /// Key used to label errors about the whole collection, e.g. `report:proyecto/7`.
  pub fn key(&self) -> CacheKey {
    match &self.project_id {
      Some(project_id) => CacheKey::new(self.entity_type, format!("proyecto/{}", project_id)),
      None => CacheKey::new(self.entity_type, "*"),
    }
  }

  /// Whether a cached entry belongs to this collection.
  pub fn matches(&self, entry: &CacheEntry) -> bool {
    if entry.key.entity_type != self.entity_type {
      return false;
    }
    match &self.project_id {
      Some(project_id) => entry
        .payload
        .get(PROJECT_REF)
        .and_then(Value::as_str)
        .is_some_and(|id| id == project_id),
      None => true,
    }
  }
}

/// Server operations the sync core depends on.
///
/// Transport details (verbs, URLs, headers) belong to the implementation.
/// The only contract is a monotonically increasing `version` per entity.
#[async_trait]
pub trait Remote: Send + Sync {
  /// Fetch the current server copy of an entity.
  async fn fetch_entity(&self, key: &CacheKey) -> SyncResult<RemoteRecord>;

  /// Apply a merge patch on the server, returning the canonical result.
  async fn mutate_entity(&self, key: &CacheKey, patch: &Value) -> SyncResult<RemoteRecord>;

  /// Fetch every entity of a collection.
  async fn fetch_collection(&self, query: &ListQuery) -> SyncResult<Vec<(CacheKey, RemoteRecord)>>;

  /// Create an entity; the server assigns its id.
  async fn create_entity(
    &self,
    entity_type: EntityType,
    payload: &Value,
  ) -> SyncResult<(CacheKey, RemoteRecord)>;
}
