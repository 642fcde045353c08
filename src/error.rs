//! Error kinds surfaced by the sync core.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::CacheKey;

/// Failures produced by reads, writes and the network boundary.
///
/// `Clone` is required so a single in-flight request can hand the
/// identical outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Transport failure or timeout talking to the server.
  #[error("network error for {key}: {reason}")]
  Network { key: CacheKey, reason: String },

  /// Server and cache agree on the version but not on the payload.
  #[error("conflicting payloads for {key} at version {version}")]
  Conflict { key: CacheKey, version: u64 },

  /// The caller asked for fresh data but only a stale copy is available.
  #[error("only stale data available for {key} (fetched at {fetched_at})")]
  StaleData {
    key: CacheKey,
    fetched_at: DateTime<Utc>,
  },

  /// Entity is absent both locally and remotely.
  #[error("{key} not found")]
  NotFound { key: CacheKey },
}

impl SyncError {
  pub fn network(key: &CacheKey, reason: impl Into<String>) -> Self {
    Self::Network {
      key: key.clone(),
      reason: reason.into(),
    }
  }

  pub fn not_found(key: &CacheKey) -> Self {
    Self::NotFound { key: key.clone() }
  }

  pub fn key(&self) -> &CacheKey {
    match self {
      Self::Network { key, .. }
      | Self::Conflict { key, .. }
      | Self::StaleData { key, .. }
      | Self::NotFound { key } => key,
    }
  }

  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
