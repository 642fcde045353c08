//! Local-first entity cache with write-back sync.
//!
//! Reads are served from a local store while fresh and go through the
//! network otherwise, with concurrent fetches for one key collapsed into a
//! single request. Writes are applied locally first and confirmed with the
//! server in the background, rolling back if the server rejects them.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod session;
pub mod sync;

pub use cache::{
  CacheEntry, CacheKey, CacheResult, CacheSource, EntityType, EntryState, ListResult, LocalStore,
};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use remote::{HttpRemote, ListQuery, Remote, RemoteRecord};
pub use session::Session;
pub use sync::{ConflictResolver, InFlightRegistry, ReadOptions, SyncEngine, WriteOptions};
