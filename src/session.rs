//! Logged-in user context on top of the sync engine.

use serde_json::Value;
use std::sync::RwLock;
use tracing::info;

use crate::cache::{CacheEntry, CacheKey, CacheResult, EntityType};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteRecord;
use crate::sync::{ReadOptions, SyncEngine};

/// Setting under which the logged-in user id outlives the process.
const CURRENT_USER: &str = "current_user";

pub struct Session {
  engine: SyncEngine,
  current: RwLock<Option<String>>,
}

impl Session {
  pub fn new(engine: SyncEngine) -> Self {
    Self {
      engine,
      current: RwLock::new(None),
    }
  }

  /// Session for whoever was logged in when the store was last used.
  ///
  /// The profile itself comes from the cache like any other read.
  pub fn restore(engine: SyncEngine) -> Self {
    let user_id = engine.store().setting(CURRENT_USER);
    if let Some(user_id) = &user_id {
      info!(user_id = user_id.as_str(), "Restored session");
    }
    Self {
      engine,
      current: RwLock::new(user_id),
    }
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  /// Remember `user_id` and cache the profile returned by the login call.
  pub fn login(&self, user_id: &str, profile: RemoteRecord) -> SyncResult<CacheEntry> {
    let entry = self.engine.prime(&CacheKey::user(user_id), profile)?;
    *self
      .current
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(user_id.to_string());
    self.engine.store().set_setting(CURRENT_USER, Some(user_id));
    info!(user_id, version = entry.version, "Logged in");
    Ok(entry)
  }

  pub fn current_user_id(&self) -> Option<String> {
    self
      .current
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  fn current_key(&self) -> SyncResult<CacheKey> {
    self
      .current_user_id()
      .map(CacheKey::user)
      .ok_or_else(|| SyncError::not_found(&CacheKey::user("")))
  }

  /// Profile of the logged-in user, read through the cache.
  pub async fn current_user(&self, opts: ReadOptions) -> SyncResult<CacheResult> {
    let key = self.current_key()?;
    self.engine.read(&key, opts).await
  }

  /// Apply a merge patch to the logged-in user's profile.
  pub async fn update_profile(&self, patch: Value) -> SyncResult<CacheEntry> {
    let key = self.current_key()?;
    self.engine.write(&key, patch).await
  }

  /// Forget the user and drop every cached entity so nothing leaks into
  /// the next login.
  pub fn logout(&self) -> usize {
    let user_id = self
      .current
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    self.engine.store().set_setting(CURRENT_USER, None);

    let dropped = EntityType::ALL
      .iter()
      .map(|entity_type| self.engine.invalidate_by_type(*entity_type))
      .sum();
    info!(user_id = user_id.as_deref().unwrap_or("-"), dropped, "Logged out");
    dropped
  }
}
