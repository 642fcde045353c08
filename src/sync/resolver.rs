//! Last-writer-wins-by-version merging of server and local entries.

use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::error::{SyncError, SyncResult};

/// Outcome of a merge, kept so callers can log which side won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeWinner {
  Incoming,
  Existing,
}

/// Merges an incoming entry with the one already cached.
///
/// Rules:
/// - no existing entry, or a higher incoming version: incoming wins
/// - a higher existing version: existing wins, incoming is dropped
/// - equal versions with equal payloads: incoming wins
/// - equal versions with different payloads: `SyncError::Conflict`
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
  pub fn merge(
    &self,
    existing: Option<&CacheEntry>,
    incoming: CacheEntry,
  ) -> SyncResult<CacheEntry> {
    self
      .resolve(existing, incoming)
      .map(|(entry, _)| entry)
  }

  pub fn resolve(
    &self,
    existing: Option<&CacheEntry>,
    incoming: CacheEntry,
  ) -> SyncResult<(CacheEntry, MergeWinner)> {
    let Some(existing) = existing else {
      return Ok((incoming, MergeWinner::Incoming));
    };

    if incoming.version > existing.version {
      return Ok((incoming, MergeWinner::Incoming));
    }

    if existing.version > incoming.version {
      debug!(
        key = %existing.key,
        existing = existing.version,
        incoming = incoming.version,
        "Dropping older incoming entry"
      );
      return Ok((existing.clone(), MergeWinner::Existing));
    }

    if existing.payload == incoming.payload {
      return Ok((incoming, MergeWinner::Incoming));
    }

    warn!(key = %existing.key, version = existing.version, "Divergent payloads at equal version");
    Err(SyncError::Conflict {
      key: existing.key.clone(),
      version: existing.version,
    })
  }
}
