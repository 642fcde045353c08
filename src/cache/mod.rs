//! Local entity cache and its persistence.
//!
//! This module provides the storage half of the sync core:
//! - `CacheKey` / `CacheEntry` describe one cached user, project or report
//! - `LocalStore` is the in-memory map, flushed to a `Persistence` backend
//! - `SqlitePersistence` keeps entries across restarts; `NoopPersistence`
//!   degrades the store to memory-only

mod entry;
mod storage;
mod store;
mod traits;

pub use entry::{CacheEntry, CacheKey, EntityType, EntryState};
pub use storage::{NoopPersistence, SqlitePersistence};
pub use store::LocalStore;
pub use traits::{CacheResult, CacheSource, ListResult, Persistence};
