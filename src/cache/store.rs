//! In-memory entity map with write-through persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheKey, EntityType};
use super::storage::NoopPersistence;
use super::traits::Persistence;

/// Key-value cache of entries, one per `CacheKey`.
///
/// The in-memory map is authoritative for the process lifetime. Every
/// `put` and `delete` is flushed to the persistence backend; a failed
/// flush is logged and otherwise ignored.
pub struct LocalStore {
  entries: RwLock<HashMap<CacheKey, CacheEntry>>,
  persistence: Arc<dyn Persistence>,
}

impl LocalStore {
  /// Memory-only store.
  pub fn in_memory() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      persistence: Arc::new(NoopPersistence),
    }
  }

  /// Store backed by `persistence`, hydrated from whatever it holds.
  pub fn open(persistence: Arc<dyn Persistence>) -> Self {
    let mut entries = HashMap::new();

    match persistence.keys() {
      Ok(keys) => {
        for key in keys {
          match persistence.read(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry>(&bytes) {
              Ok(entry) if entry.key == key => {
                entries.insert(key, entry);
              }
              Ok(entry) => {
                warn!(%key, stored = %entry.key, "Skipping entry stored under wrong key")
              }
              Err(e) => warn!(%key, error = %e, "Skipping undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "Skipping unreadable cache entry"),
          }
        }
      }
      Err(e) => warn!(error = %e, "Failed to list persisted entries; starting empty"),
    }

    debug!(count = entries.len(), "Hydrated local store");

    Self {
      entries: RwLock::new(entries),
      persistence,
    }
  }

  /// Look up an entry. Never blocks on I/O.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self
      .entries
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .get(key)
      .cloned()
  }

  /// Store an entry unconditionally. Version checks are the caller's job.
  pub fn put(&self, entry: CacheEntry) {
    let key = entry.key.clone();
    let bytes = serde_json::to_vec(&entry);

    self
      .entries
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(key.clone(), entry);

    match bytes {
      Ok(bytes) => {
        if let Err(e) = self.persistence.write(&key, &bytes) {
          warn!(%key, error = %e, "Failed to persist cache entry");
        }
      }
      Err(e) => warn!(%key, error = %e, "Failed to serialize cache entry"),
    }
  }

  /// Remove an entry. Removing an absent key is a no-op.
  pub fn delete(&self, key: &CacheKey) {
    self
      .entries
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(key);

    if let Err(e) = self.persistence.remove(key) {
      warn!(%key, error = %e, "Failed to remove persisted cache entry");
    }
  }

  /// All entries of one entity type, ordered by id.
  pub fn list_by_type(&self, entity_type: EntityType) -> Vec<CacheEntry> {
    let mut entries: Vec<CacheEntry> = self
      .entries
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .values()
      .filter(|e| e.key.entity_type == entity_type)
      .cloned()
      .collect();
    entries.sort_by(|a, b| a.key.id.cmp(&b.key.id));
    entries
  }

  /// Named value from the persistence backend. Failures read as absent.
  pub fn setting(&self, name: &str) -> Option<String> {
    self
      .persistence
      .read_setting(name)
      .unwrap_or_else(|e| {
        warn!(name, error = %e, "Failed to read setting");
        None
      })
  }

  /// Persist a named value, or clear it with `None`.
  pub fn set_setting(&self, name: &str, value: Option<&str>) {
    if let Err(e) = self.persistence.write_setting(name, value) {
      warn!(name, error = %e, "Failed to persist setting");
    }
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
