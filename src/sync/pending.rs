//! Optimistic writes awaiting server confirmation.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;

use super::patch;
use crate::cache::{CacheEntry, CacheKey, EntryState};

/// An optimistic mutation queued against a key.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
  pub id: u64,
  pub key: CacheKey,
  pub mutation_payload: Value,
  /// Version of the optimistic entry this write produced
  pub local_version: u64,
  /// Times the mutation has been sent to the server
  pub attempts: u32,
}

/// Per-key write state: the last server-confirmed entry plus the
/// writes layered on top of it, in invocation order.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrites {
  pub(crate) base: Option<CacheEntry>,
  queue: VecDeque<PendingWrite>,
}

impl PendingWrites {
  pub(crate) fn new(base: Option<CacheEntry>) -> Self {
    Self {
      base,
      queue: VecDeque::new(),
    }
  }

  /// Queue a write and return the version of the resulting optimistic entry.
  pub(crate) fn push(&mut self, id: u64, key: CacheKey, mutation_payload: Value) -> u64 {
    let local_version = self.visible_version() + 1;
    self.queue.push_back(PendingWrite {
      id,
      key,
      mutation_payload,
      local_version,
      attempts: 0,
    });
    local_version
  }

  pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut PendingWrite> {
    self.queue.iter_mut().find(|w| w.id == id)
  }

  pub(crate) fn contains(&self, id: u64) -> bool {
    self.queue.iter().any(|w| w.id == id)
  }

  /// Drop a write that will never reach the server. Writes queued behind
  /// it now expect one version less.
  pub(crate) fn remove(&mut self, id: u64) -> Option<PendingWrite> {
    let index = self.queue.iter().position(|w| w.id == id)?;
    let removed = self.queue.remove(index)?;
    for write in self.queue.iter_mut().skip(index) {
      write.local_version -= 1;
    }
    Some(removed)
  }

  /// Drop a write the server confirmed at `version`. The writes behind it
  /// are expected to land right after that version.
  pub(crate) fn confirm(&mut self, id: u64, version: u64) -> Option<PendingWrite> {
    let index = self.queue.iter().position(|w| w.id == id)?;
    let confirmed = self.queue.remove(index)?;
    for (offset, write) in self.queue.iter_mut().enumerate() {
      write.local_version = version + offset as u64 + 1;
    }
    Some(confirmed)
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub(crate) fn writes(&self) -> impl Iterator<Item = &PendingWrite> {
    self.queue.iter()
  }

  fn base_version(&self) -> u64 {
    self.base.as_ref().map(|b| b.version).unwrap_or(0)
  }

  fn visible_version(&self) -> u64 {
    self
      .queue
      .back()
      .map(|w| w.local_version)
      .unwrap_or(0)
      .max(self.base_version())
  }

  /// The entry readers should see: base with the queued patches the base
  /// does not already contain applied on top.
  ///
  /// A write whose expected version is at or below the base version has
  /// been committed by the server and is already part of the base. With
  /// nothing queued this is the base itself.
  pub(crate) fn visible(&self, key: &CacheKey, ttl_ms: u64) -> Option<CacheEntry> {
    if self.queue.is_empty() {
      return self.base.clone();
    }

    let base_version = self.base_version();
    let mut payload = self
      .base
      .as_ref()
      .map(|b| b.payload.clone())
      .unwrap_or_else(|| json!({}));
    for write in self.queue.iter().filter(|w| w.local_version > base_version) {
      patch::apply(&mut payload, &write.mutation_payload);
    }

    Some(CacheEntry {
      key: key.clone(),
      payload,
      version: self.visible_version(),
      fetched_at: self.base.as_ref().map(|b| b.fetched_at).unwrap_or_else(Utc::now),
      ttl_ms: self.base.as_ref().map(|b| b.ttl_ms).unwrap_or(ttl_ms),
      state: EntryState::Pending,
    })
  }
}
