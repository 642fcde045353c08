//! Read-through / write-back synchronization between the local cache and
//! the server.
//!
//! - `InFlightRegistry` collapses concurrent fetches for a key into one
//! - `ConflictResolver` decides which of two versions of an entry survives
//! - `SyncEngine` drives reads, optimistic writes and invalidation

mod engine;
mod patch;
mod pending;
mod registry;
mod resolver;

pub use engine::{ReadOptions, SyncEngine, SyncEngineBuilder, WriteOptions};
pub use patch::{applied as apply_patch, apply as apply_patch_in_place};
pub use pending::PendingWrite;
pub use registry::{InFlightRegistry, Waiter};
pub use resolver::{ConflictResolver, MergeWinner};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
