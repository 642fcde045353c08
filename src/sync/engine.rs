//! Sync engine that orchestrates the local cache with the server.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::lock;
use super::pending::{PendingWrite, PendingWrites};
use super::registry::InFlightRegistry;
use super::resolver::ConflictResolver;
use crate::cache::{
  CacheEntry, CacheKey, CacheResult, CacheSource, EntityType, EntryState, ListResult, LocalStore,
  NoopPersistence, Persistence, SqlitePersistence,
};
use crate::config::{Config, TtlConfig};
use crate::error::{SyncError, SyncResult};
use crate::remote::{ListQuery, Remote, RemoteRecord};

/// Per-call read policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
  /// Serve cached data younger than this (default: the entity type's TTL)
  pub max_age: Option<Duration>,
  /// Give up waiting on the network after this (default: engine timeout)
  pub timeout: Option<Duration>,
}

impl ReadOptions {
  pub fn max_age(max_age: Duration) -> Self {
    Self {
      max_age: Some(max_age),
      timeout: None,
    }
  }

  /// Always go to the network.
  pub fn refresh() -> Self {
    Self::max_age(Duration::ZERO)
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Per-call write policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
  /// Roll back if the server has not confirmed within this (default: engine timeout)
  pub timeout: Option<Duration>,
}

impl WriteOptions {
  pub fn timeout(timeout: Duration) -> Self {
    Self {
      timeout: Some(timeout),
    }
  }
}

/// Completion signal of the last write dispatched for a key.
type Lane = Shared<BoxFuture<'static, ()>>;

/// Bookkeeping guarded by one lock so every mutation of a key's cache
/// entry goes through a single path.
#[derive(Default)]
struct KeyStates {
  writes: HashMap<CacheKey, PendingWrites>,
  lanes: HashMap<CacheKey, (u64, Lane)>,
  /// Ticks once per invalidation
  clock: u64,
  key_invalidated: HashMap<CacheKey, u64>,
  type_invalidated: HashMap<EntityType, u64>,
  next_write_id: u64,
}

impl KeyStates {
  /// Point in the invalidation history that network work starts at.
  fn stamp(&self) -> u64 {
    self.clock
  }

  /// Whether `key`, alone or with its whole type, was invalidated after `stamp`.
  fn invalidated_since(&self, key: &CacheKey, stamp: u64) -> bool {
    let after = |at: Option<&u64>| at.is_some_and(|at| *at > stamp);
    after(self.key_invalidated.get(key)) || after(self.type_invalidated.get(&key.entity_type))
  }
}

struct EngineInner {
  store: Arc<LocalStore>,
  remote: Arc<dyn Remote>,
  registry: InFlightRegistry<CacheResult>,
  resolver: ConflictResolver,
  ttl: TtlConfig,
  timeout: Duration,
  keys: Mutex<KeyStates>,
}

/// Read-through cache with optimistic write-back.
///
/// - `read` serves fresh entries locally and otherwise fetches once per
///   key no matter how many callers ask, falling back to stale data when
///   the network fails
/// - `write` applies a merge patch locally right away, sends it to the
///   server in invocation order per key, and rolls back on failure
/// - `invalidate` drops entries so the next read goes to the network
///
/// Network work runs on spawned tasks and always completes, even when the
/// caller stops waiting.
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
  store: Arc<LocalStore>,
  remote: Arc<dyn Remote>,
  ttl: TtlConfig,
  timeout: Duration,
}

impl SyncEngineBuilder {
  pub fn ttl(mut self, ttl: TtlConfig) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn build(self) -> SyncEngine {
    SyncEngine {
      inner: Arc::new(EngineInner {
        store: self.store,
        remote: self.remote,
        registry: InFlightRegistry::new(),
        resolver: ConflictResolver,
        ttl: self.ttl,
        timeout: self.timeout,
        keys: Mutex::new(KeyStates::default()),
      }),
    }
  }
}

impl SyncEngine {
  pub fn builder(store: Arc<LocalStore>, remote: Arc<dyn Remote>) -> SyncEngineBuilder {
    SyncEngineBuilder {
      store,
      remote,
      ttl: TtlConfig::default(),
      timeout: Duration::from_secs(10),
    }
  }

  pub fn new(store: Arc<LocalStore>, remote: Arc<dyn Remote>) -> Self {
    Self::builder(store, remote).build()
  }

  /// Engine with the store, TTLs and timeout described by `config`.
  pub fn from_config(config: &Config, remote: Arc<dyn Remote>) -> color_eyre::Result<Self> {
    let persistence: Arc<dyn Persistence> = if config.cache.persist {
      Arc::new(SqlitePersistence::open(config.cache.path.as_deref())?)
    } else {
      Arc::new(NoopPersistence)
    };
    let store = Arc::new(LocalStore::open(persistence));

    Ok(
      Self::builder(store, remote)
        .ttl(config.cache.ttl_secs)
        .timeout(config.server.timeout())
        .build(),
    )
  }

  pub fn store(&self) -> &Arc<LocalStore> {
    &self.inner.store
  }

  /// Current local entry for `key`, without touching the network.
  pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.inner.store.get(key)
  }

  pub fn list(&self, entity_type: EntityType) -> Vec<CacheEntry> {
    self.inner.store.list_by_type(entity_type)
  }

  /// Writes for `key` still waiting on the server, oldest first.
  pub fn pending_writes(&self, key: &CacheKey) -> Vec<PendingWrite> {
    lock(&self.inner.keys)
      .writes
      .get(key)
      .map(|w| w.writes().cloned().collect())
      .unwrap_or_default()
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.inner.registry.is_in_flight(key)
  }

  /// Read an entity, going to the network only when the cached copy is
  /// missing or older than `opts.max_age`.
  ///
  /// The cache lookup and fetch registration happen when this is called;
  /// the returned future only waits for the outcome.
  pub fn read(
    &self,
    key: &CacheKey,
    opts: ReadOptions,
  ) -> BoxFuture<'static, SyncResult<CacheResult>> {
    let now = Utc::now();
    if let Some(entry) = self.inner.store.get(key) {
      let max_age = opts.max_age.unwrap_or_else(|| entry.ttl());
      if entry.is_servable(max_age, now) {
        debug!(%key, version = entry.version, "Cache hit");
        let result = CacheResult::from_cache(&entry);
        return async move { Ok(result) }.boxed();
      }
    }

    let stamp = lock(&self.inner.keys).stamp();
    let producer = Arc::clone(&self.inner);
    let fetch_key = key.clone();
    let waiter = self
      .inner
      .registry
      .get_or_start(key, move || producer.fetch_and_populate(fetch_key, stamp));

    let inner = Arc::clone(&self.inner);
    let key = key.clone();
    let timeout = opts.timeout.unwrap_or(self.inner.timeout);

    async move {
      match tokio::time::timeout(timeout, waiter).await {
        Ok(result) => result,
        Err(_) => {
          let err = SyncError::network(&key, format!("timed out after {}ms", timeout.as_millis()));
          match inner.store.get(&key) {
            Some(entry) => {
              warn!(%key, version = entry.version, "Fetch timed out; serving cached copy");
              Ok(CacheResult::stale(&entry, err))
            }
            None => Err(err),
          }
        }
      }
    }
    .boxed()
  }

  /// Fetch a whole collection and merge every entity into the cache.
  ///
  /// Listings always go to the network since the cache cannot tell whether
  /// it holds every member. When the server cannot be reached the cached
  /// members are served as stale, or the error propagates when none are
  /// cached.
  pub fn read_list(
    &self,
    query: &ListQuery,
    timeout: Option<Duration>,
  ) -> BoxFuture<'static, SyncResult<ListResult>> {
    let stamp = lock(&self.inner.keys).stamp();
    let (reply, settled) = oneshot::channel();
    let inner = Arc::clone(&self.inner);
    let task_query = query.clone();

    tokio::spawn(async move {
      debug!(key = %task_query.key(), "Fetching collection");
      let outcome = inner
        .remote
        .fetch_collection(&task_query)
        .await
        .map(|items| inner.absorb_collection(items, stamp));
      let _ = reply.send(outcome);
    });

    let inner = Arc::clone(&self.inner);
    let query = query.clone();
    let timeout = timeout.unwrap_or(self.inner.timeout);

    async move {
      let err = match tokio::time::timeout(timeout, settled).await {
        Ok(Ok(Ok(entries))) => {
          return Ok(ListResult {
            entries,
            source: CacheSource::Network,
            stale_reason: None,
          })
        }
        Ok(Ok(Err(err))) => err,
        Ok(Err(_)) => SyncError::network(&query.key(), "list task aborted"),
        Err(_) => {
          SyncError::network(&query.key(), format!("timed out after {}ms", timeout.as_millis()))
        }
      };

      let cached: Vec<CacheEntry> = inner
        .store
        .list_by_type(query.entity_type)
        .into_iter()
        .filter(|entry| query.matches(entry))
        .collect();
      if cached.is_empty() || matches!(err, SyncError::NotFound { .. }) {
        return Err(err);
      }

      warn!(
        key = %query.key(),
        count = cached.len(),
        error = %err,
        "Listing failed; serving cached copies"
      );
      Ok(ListResult {
        entries: cached,
        source: CacheSource::CacheStale,
        stale_reason: Some(err),
      })
    }
    .boxed()
  }

  /// Apply `mutation` (a JSON merge patch) optimistically and confirm it
  /// with the server.
  pub fn write(
    &self,
    key: &CacheKey,
    mutation: Value,
  ) -> BoxFuture<'static, SyncResult<CacheEntry>> {
    self.write_with(key, mutation, WriteOptions::default())
  }

  /// Like [`write`](Self::write) with an explicit timeout.
  ///
  /// The optimistic entry is in the store as soon as this returns.
  pub fn write_with(
    &self,
    key: &CacheKey,
    mutation: Value,
    opts: WriteOptions,
  ) -> BoxFuture<'static, SyncResult<CacheEntry>> {
    let (id, mut settled) = self.inner.enqueue_write(key, mutation);
    let inner = Arc::clone(&self.inner);
    let key = key.clone();
    let timeout = opts.timeout.unwrap_or(self.inner.timeout);

    async move {
      match tokio::time::timeout(timeout, &mut settled).await {
        Ok(outcome) => {
          outcome.unwrap_or_else(|_| Err(SyncError::network(&key, "write task aborted")))
        }
        Err(_) => {
          let err = SyncError::network(
            &key,
            format!("write timed out after {}ms", timeout.as_millis()),
          );
          if inner.withdraw(&key, id) {
            warn!(%key, id, "Write timed out; rolled back");
            return Err(err);
          }
          // Settled while the timer fired; outcomes are sent under the lock
          settled.try_recv().unwrap_or(Err(err))
        }
      }
    }
    .boxed()
  }

  /// Create an entity on the server and cache what it returns.
  pub fn create(
    &self,
    entity_type: EntityType,
    payload: Value,
  ) -> BoxFuture<'static, SyncResult<CacheEntry>> {
    self.create_with(entity_type, payload, WriteOptions::default())
  }

  /// Like [`create`](Self::create) with an explicit timeout.
  ///
  /// Not optimistic: the server assigns the id, so nothing is cached until
  /// it answers. An answer arriving after the timeout is still cached.
  pub fn create_with(
    &self,
    entity_type: EntityType,
    payload: Value,
    opts: WriteOptions,
  ) -> BoxFuture<'static, SyncResult<CacheEntry>> {
    let stamp = lock(&self.inner.keys).stamp();
    let (reply, settled) = oneshot::channel();
    let inner = Arc::clone(&self.inner);

    tokio::spawn(async move {
      let created = inner.remote.create_entity(entity_type, &payload).await;
      let outcome = match created {
        Ok((key, record)) => {
          let incoming = inner.entry_from(&key, record);
          let mut keys = lock(&inner.keys);
          if keys.invalidated_since(&key, stamp) {
            debug!(%key, "Invalidated during create; result not cached");
            Ok(incoming)
          } else {
            info!(%key, version = incoming.version, "Created");
            inner.absorb(&mut keys, incoming)
          }
        }
        Err(err) => {
          warn!(%entity_type, error = %err, "Create rejected");
          Err(err)
        }
      };
      let _ = reply.send(outcome);
    });

    let pending = CacheKey::new(entity_type, "*");
    let timeout = opts.timeout.unwrap_or(self.inner.timeout);

    async move {
      match tokio::time::timeout(timeout, settled).await {
        Ok(outcome) => {
          outcome.unwrap_or_else(|_| Err(SyncError::network(&pending, "create task aborted")))
        }
        Err(_) => Err(SyncError::network(
          &pending,
          format!("create timed out after {}ms", timeout.as_millis()),
        )),
      }
    }
    .boxed()
  }

  /// Merge a server record obtained elsewhere (e.g. a login response).
  pub fn prime(&self, key: &CacheKey, record: RemoteRecord) -> SyncResult<CacheEntry> {
    let incoming = self.inner.entry_from(key, record);
    let mut keys = lock(&self.inner.keys);
    self.inner.absorb(&mut keys, incoming)
  }

  /// Drop the cached entry for `key`; the next read goes to the network.
  ///
  /// Queued writes for the key are forgotten, and network work already
  /// running is detached so it cannot repopulate the entry.
  pub fn invalidate(&self, key: &CacheKey) {
    let mut keys = lock(&self.inner.keys);
    keys.clock += 1;
    let now = keys.clock;
    keys.key_invalidated.insert(key.clone(), now);
    let dropped = keys
      .writes
      .remove(key)
      .map(|w| w.writes().count())
      .unwrap_or(0);

    self.inner.store.delete(key);
    self.inner.registry.forget(key);
    info!(%key, dropped_writes = dropped, "Invalidated");
  }

  /// Invalidate every cached entity of one type. Returns how many entries were dropped.
  pub fn invalidate_by_type(&self, entity_type: EntityType) -> usize {
    let mut keys = lock(&self.inner.keys);
    keys.clock += 1;
    let now = keys.clock;
    keys.type_invalidated.insert(entity_type, now);
    keys.writes.retain(|key, _| key.entity_type != entity_type);

    let entries = self.inner.store.list_by_type(entity_type);
    for entry in &entries {
      self.inner.store.delete(&entry.key);
    }
    let detached = self
      .inner
      .registry
      .forget_matching(|key| key.entity_type == entity_type);

    info!(%entity_type, count = entries.len(), detached, "Invalidated entity type");
    entries.len()
  }
}

impl Clone for SyncEngine {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl EngineInner {
  fn ttl_ms(&self, entity_type: EntityType) -> u64 {
    self.ttl.for_type(entity_type).as_millis() as u64
  }

  fn entry_from(&self, key: &CacheKey, record: RemoteRecord) -> CacheEntry {
    CacheEntry::new(
      key.clone(),
      record.payload,
      record.version,
      self.ttl_ms(key.entity_type),
    )
  }

  /// Fetch `key` and fold the result into the store.
  ///
  /// Runs once per in-flight request; every waiter gets this outcome.
  async fn fetch_and_populate(
    self: Arc<Self>,
    key: CacheKey,
    stamp: u64,
  ) -> SyncResult<CacheResult> {
    debug!(%key, "Fetching from network");
    let fetched = self.remote.fetch_entity(&key).await;

    let mut keys = lock(&self.keys);
    let current = !keys.invalidated_since(&key, stamp);

    match fetched {
      Ok(record) => {
        let incoming = self.entry_from(&key, record);
        if !current {
          debug!(%key, "Invalidated during fetch; result not cached");
          return Ok(CacheResult::from_network(&incoming));
        }
        let entry = self.absorb(&mut keys, incoming)?;
        Ok(CacheResult::from_network(&entry))
      }
      Err(err @ SyncError::NotFound { .. }) => {
        if current && !keys.writes.contains_key(&key) && self.store.get(&key).is_some() {
          info!(%key, "Entity gone on server; dropping cached copy");
          self.store.delete(&key);
        }
        Err(err)
      }
      Err(err) => {
        let Some(mut entry) = self.store.get(&key) else {
          return Err(err);
        };
        if current && matches!(entry.state, EntryState::Fresh | EntryState::Error) {
          entry.state = EntryState::Stale;
          self.store.put(entry.clone());
        }
        warn!(%key, version = entry.version, error = %err, "Fetch failed; serving cached copy");
        Ok(CacheResult::stale(&entry, err))
      }
    }
  }

  /// Fold every member of a listed collection into the store.
  ///
  /// A member that conflicts with its cached copy keeps the cached copy.
  fn absorb_collection(&self, items: Vec<(CacheKey, RemoteRecord)>, stamp: u64) -> Vec<CacheEntry> {
    let mut keys = lock(&self.keys);
    items
      .into_iter()
      .filter_map(|(key, record)| {
        let incoming = self.entry_from(&key, record);
        if keys.invalidated_since(&key, stamp) {
          return Some(incoming);
        }
        match self.absorb(&mut keys, incoming) {
          Ok(entry) => Some(entry),
          Err(err) => {
            warn!(%key, error = %err, "Listed copy conflicts with cache; keeping cached copy");
            self.store.get(&key)
          }
        }
      })
      .collect()
  }

  /// The stored entry, unless it is an optimistic write nothing tracks.
  ///
  /// Such a row was persisted by a process that stopped before the server
  /// answered, so the server never confirmed it. Only call this for keys
  /// without pending writes.
  fn confirmed_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.store.get(key).filter(|entry| {
      if entry.state == EntryState::Pending {
        warn!(%key, version = entry.version, "Discarding unconfirmed write from earlier session");
        return false;
      }
      true
    })
  }

  /// Fold a server-confirmed entry into the store through the resolver.
  ///
  /// With writes pending the record becomes the new base and the queued
  /// patches it does not already contain are replayed on top of it.
  fn absorb(&self, keys: &mut KeyStates, incoming: CacheEntry) -> SyncResult<CacheEntry> {
    let key = incoming.key.clone();
    let ttl_ms = incoming.ttl_ms;

    if let Some(writes) = keys.writes.get_mut(&key) {
      let (mut base, winner) = self.resolver.resolve(writes.base.as_ref(), incoming)?;
      debug!(%key, ?winner, version = base.version, "Merged server copy under pending writes");
      base.state = EntryState::Fresh;
      base.fetched_at = Utc::now();
      writes.base = Some(base.clone());

      let visible = writes.visible(&key, ttl_ms).unwrap_or(base);
      self.store.put(visible.clone());
      return Ok(visible);
    }

    let existing = self.confirmed_entry(&key);
    let (mut merged, winner) = self.resolver.resolve(existing.as_ref(), incoming)?;
    debug!(%key, ?winner, version = merged.version, "Merged server copy");
    merged.state = EntryState::Fresh;
    merged.fetched_at = Utc::now();
    self.store.put(merged.clone());
    Ok(merged)
  }

  /// Queue an optimistic write and spawn its flush.
  fn enqueue_write(
    self: &Arc<Self>,
    key: &CacheKey,
    mutation: Value,
  ) -> (u64, oneshot::Receiver<SyncResult<CacheEntry>>) {
    let ttl_ms = self.ttl_ms(key.entity_type);
    let mut keys = lock(&self.keys);

    let id = keys.next_write_id;
    keys.next_write_id += 1;
    let stamp = keys.stamp();

    let writes = keys
      .writes
      .entry(key.clone())
      .or_insert_with(|| PendingWrites::new(self.confirmed_entry(key)));
    let local_version = writes.push(id, key.clone(), mutation);
    if let Some(optimistic) = writes.visible(key, ttl_ms) {
      self.store.put(optimistic);
    }
    debug!(%key, id, version = local_version, "Applied optimistic write");

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let lane: Lane = done_rx.map(|_| ()).boxed().shared();
    let previous = keys
      .lanes
      .insert(key.clone(), (id, lane))
      .map(|(_, lane)| lane);

    let (reply, settled) = oneshot::channel();
    let inner = Arc::clone(self);
    let task_key = key.clone();

    tokio::spawn(async move {
      if let Some(previous) = previous {
        previous.await;
      }
      inner.flush_write(&task_key, id, stamp, reply).await;

      {
        let mut keys = lock(&inner.keys);
        if keys
          .lanes
          .get(&task_key)
          .is_some_and(|(lane_id, _)| *lane_id == id)
        {
          keys.lanes.remove(&task_key);
        }
      }
      let _ = done_tx.send(());
    });

    (id, settled)
  }

  /// Send one queued write to the server and settle it.
  async fn flush_write(
    &self,
    key: &CacheKey,
    id: u64,
    stamp: u64,
    reply: oneshot::Sender<SyncResult<CacheEntry>>,
  ) {
    let patch = {
      let mut keys = lock(&self.keys);
      match keys.writes.get_mut(key).and_then(|w| w.get_mut(id)) {
        Some(write) => {
          write.attempts += 1;
          write.mutation_payload.clone()
        }
        None => {
          debug!(%key, id, "Write withdrawn before dispatch; not sent");
          let _ = reply.send(Err(SyncError::network(key, "write withdrawn before dispatch")));
          return;
        }
      }
    };

    let outcome = self.remote.mutate_entity(key, &patch).await;

    let mut keys = lock(&self.keys);
    let result = self.settle_write(&mut keys, key, id, stamp, outcome);
    let _ = reply.send(result);
  }

  fn settle_write(
    &self,
    keys: &mut KeyStates,
    key: &CacheKey,
    id: u64,
    stamp: u64,
    outcome: SyncResult<RemoteRecord>,
  ) -> SyncResult<CacheEntry> {
    let current = !keys.invalidated_since(key, stamp);
    let queued = current && keys.writes.get(key).is_some_and(|w| w.contains(id));

    match outcome {
      Ok(record) => {
        let incoming = self.entry_from(key, record);
        if !current {
          debug!(%key, id, "Invalidated during write; confirmation not cached");
          return Ok(incoming);
        }
        if !queued {
          info!(%key, id, version = incoming.version, "Applying late write confirmation");
          return self.absorb(keys, incoming);
        }

        let Some(writes) = keys.writes.get_mut(key) else {
          return Ok(incoming);
        };
        writes.confirm(id, incoming.version);

        match self.resolver.resolve(writes.base.as_ref(), incoming) {
          Ok((mut base, winner)) => {
            base.state = EntryState::Fresh;
            base.fetched_at = Utc::now();
            writes.base = Some(base.clone());
            info!(%key, id, version = base.version, ?winner, "Write confirmed");
            self.publish(keys, key, EntryState::Fresh);
            Ok(base)
          }
          Err(conflict) => {
            warn!(%key, id, "Write confirmation conflicts with cached base; rolling back");
            self.publish(keys, key, EntryState::Error);
            Err(conflict)
          }
        }
      }
      Err(err) => {
        if queued {
          if let Some(writes) = keys.writes.get_mut(key) {
            writes.remove(id);
          }
          warn!(%key, id, error = %err, "Write rejected; rolling back");
          self.publish(keys, key, EntryState::Error);
        }
        Err(err)
      }
    }
  }

  /// Remove a write that has not settled yet and roll the entry back.
  fn withdraw(&self, key: &CacheKey, id: u64) -> bool {
    let mut keys = lock(&self.keys);
    let removed = keys
      .writes
      .get_mut(key)
      .and_then(|w| w.remove(id))
      .is_some();
    if removed {
      self.publish(&mut keys, key, EntryState::Error);
    }
    removed
  }

  /// Store the entry implied by the key's write state.
  ///
  /// With writes still queued that is the optimistic entry. Otherwise the
  /// bookkeeping is dropped and the base is stored with `settled` state,
  /// or the mapping is deleted when no base ever existed.
  fn publish(&self, keys: &mut KeyStates, key: &CacheKey, settled: EntryState) {
    let ttl_ms = self.ttl_ms(key.entity_type);
    let Some(writes) = keys.writes.get(key) else {
      return;
    };

    if !writes.is_empty() {
      if let Some(visible) = writes.visible(key, ttl_ms) {
        self.store.put(visible);
      }
      return;
    }

    match keys.writes.remove(key).and_then(|w| w.base) {
      Some(mut base) => {
        base.state = settled;
        self.store.put(base);
      }
      None => self.store.delete(key),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::apply_patch_in_place;
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use tokio::sync::Semaphore;

  /// In-memory server with optional gates and scripted failures.
  #[derive(Default)]
  struct ScriptedRemote {
    records: Mutex<HashMap<CacheKey, RemoteRecord>>,
    fetch_gate: Option<Semaphore>,
    mutate_gate: Option<Semaphore>,
    /// Held after the server has committed a mutation, before it answers
    respond_gate: Option<Semaphore>,
    fail_fetch: AtomicBool,
    fail_mutate: AtomicBool,
    mutate_responses: Mutex<VecDeque<SyncResult<RemoteRecord>>>,
    fetch_calls: AtomicU32,
    created: AtomicU32,
    mutations: Mutex<Vec<(CacheKey, Value)>>,
  }

  impl ScriptedRemote {
    fn gated_fetch() -> Self {
      Self {
        fetch_gate: Some(Semaphore::new(0)),
        ..Self::default()
      }
    }

    fn gated_mutate() -> Self {
      Self {
        mutate_gate: Some(Semaphore::new(0)),
        ..Self::default()
      }
    }

    fn gated_response() -> Self {
      Self {
        respond_gate: Some(Semaphore::new(0)),
        ..Self::default()
      }
    }

    fn seed(&self, key: &CacheKey, payload: Value, version: u64) {
      self
        .records
        .lock()
        .unwrap()
        .insert(key.clone(), RemoteRecord::new(payload, version));
    }

    fn open_fetch(&self, n: usize) {
      if let Some(gate) = &self.fetch_gate {
        gate.add_permits(n);
      }
    }

    fn open_mutate(&self, n: usize) {
      if let Some(gate) = &self.mutate_gate {
        gate.add_permits(n);
      }
    }

    fn open_response(&self, n: usize) {
      if let Some(gate) = &self.respond_gate {
        gate.add_permits(n);
      }
    }

    fn version_of(&self, key: &CacheKey) -> Option<u64> {
      self.records.lock().unwrap().get(key).map(|r| r.version)
    }

    fn fetch_calls(&self) -> u32 {
      self.fetch_calls.load(Ordering::SeqCst)
    }

    fn mutation_count(&self) -> usize {
      self.mutations.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Remote for ScriptedRemote {
    async fn fetch_entity(&self, key: &CacheKey) -> SyncResult<RemoteRecord> {
      self.fetch_calls.fetch_add(1, Ordering::SeqCst);
      // The response reflects the server at request time
      let snapshot = self.records.lock().unwrap().get(key).cloned();
      if let Some(gate) = &self.fetch_gate {
        gate.acquire().await.unwrap().forget();
      }
      if self.fail_fetch.load(Ordering::SeqCst) {
        return Err(SyncError::network(key, "connection refused"));
      }
      snapshot.ok_or_else(|| SyncError::not_found(key))
    }

    async fn mutate_entity(&self, key: &CacheKey, patch: &Value) -> SyncResult<RemoteRecord> {
      self
        .mutations
        .lock()
        .unwrap()
        .push((key.clone(), patch.clone()));
      if let Some(gate) = &self.mutate_gate {
        gate.acquire().await.unwrap().forget();
      }

      let scripted = self.mutate_responses.lock().unwrap().pop_front();
      if let Some(scripted) = scripted {
        if let Ok(record) = &scripted {
          self
            .records
            .lock()
            .unwrap()
            .insert(key.clone(), record.clone());
        }
        return scripted;
      }
      if self.fail_mutate.load(Ordering::SeqCst) {
        return Err(SyncError::network(key, "503 service unavailable"));
      }

      let record = {
        let mut records = self.records.lock().unwrap();
        let current = records.get(key).cloned();
        let mut payload = current
          .as_ref()
          .map(|r| r.payload.clone())
          .unwrap_or_else(|| json!({}));
        apply_patch_in_place(&mut payload, patch);
        let record = RemoteRecord::new(payload, current.map(|r| r.version).unwrap_or(0) + 1);
        records.insert(key.clone(), record.clone());
        record
      };

      if let Some(gate) = &self.respond_gate {
        gate.acquire().await.unwrap().forget();
      }
      Ok(record)
    }

    async fn fetch_collection(
      &self,
      query: &ListQuery,
    ) -> SyncResult<Vec<(CacheKey, RemoteRecord)>> {
      if self.fail_fetch.load(Ordering::SeqCst) {
        return Err(SyncError::network(&query.key(), "connection refused"));
      }
      let records = self.records.lock().unwrap();
      let mut items: Vec<_> = records
        .iter()
        .filter(|(key, record)| {
          query.matches(&CacheEntry::new((*key).clone(), record.payload.clone(), record.version, 0))
        })
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect();
      items.sort_by_key(|(key, _)| key.to_string());
      Ok(items)
    }

    async fn create_entity(
      &self,
      entity_type: EntityType,
      payload: &Value,
    ) -> SyncResult<(CacheKey, RemoteRecord)> {
      let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
      let key = CacheKey::new(entity_type, format!("srv-{}", n));
      if self.fail_mutate.load(Ordering::SeqCst) {
        return Err(SyncError::network(&key, "503 service unavailable"));
      }
      let record = RemoteRecord::new(payload.clone(), 1);
      self
        .records
        .lock()
        .unwrap()
        .insert(key.clone(), record.clone());
      Ok((key, record))
    }
  }

  fn engine(remote: &Arc<ScriptedRemote>) -> SyncEngine {
    let remote: Arc<dyn Remote> = remote.clone();
    SyncEngine::builder(Arc::new(LocalStore::in_memory()), remote)
      .timeout(Duration::from_secs(5))
      .build()
  }

  /// Seed the same record on the server and in the cache.
  fn seed_both(
    engine: &SyncEngine,
    remote: &ScriptedRemote,
    key: &CacheKey,
    payload: Value,
    version: u64,
  ) {
    remote.seed(key, payload.clone(), version);
    engine
      .prime(key, RemoteRecord::new(payload, version))
      .unwrap();
  }

  async fn wait_for_version(engine: &SyncEngine, key: &CacheKey, version: u64) -> CacheEntry {
    for _ in 0..100 {
      if let Some(entry) = engine.peek(key) {
        if entry.version == version {
          return entry;
        }
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached version {}", key, version);
  }

  #[tokio::test]
  async fn test_read_miss_fetches_then_serves_from_cache() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::project("7");
    remote.seed(&key, json!({"nombre": "Red Norte"}), 1);

    let first = engine.read(&key, ReadOptions::default()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data, json!({"nombre": "Red Norte"}));

    let second = engine.read(&key, ReadOptions::default()).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.version, 1);
    assert_eq!(remote.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_reads_share_one_fetch() {
    let remote = Arc::new(ScriptedRemote::gated_fetch());
    let engine = engine(&remote);
    let key = CacheKey::project("7");
    remote.seed(&key, json!({"nombre": "Red Norte"}), 3);

    let reads: Vec<_> = (0..5)
      .map(|_| engine.read(&key, ReadOptions::default()))
      .collect();
    assert!(engine.is_fetching(&key));

    remote.open_fetch(1);
    let results = futures::future::join_all(reads).await;

    for result in &results {
      let result = result.as_ref().unwrap();
      assert_eq!(result.data, json!({"nombre": "Red Norte"}));
      assert_eq!(result.version, 3);
    }
    assert_eq!(remote.fetch_calls(), 1);
    assert!(!engine.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_max_age_forces_refresh() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::user("u1");
    remote.seed(&key, json!({"nombre": "Ana"}), 1);

    engine.read(&key, ReadOptions::default()).await.unwrap();
    remote.seed(&key, json!({"nombre": "Ana María"}), 2);

    let cached = engine
      .read(&key, ReadOptions::max_age(Duration::from_secs(3600)))
      .await
      .unwrap();
    assert_eq!(cached.version, 1);

    let refreshed = engine.read(&key, ReadOptions::refresh()).await.unwrap();
    assert_eq!(refreshed.version, 2);
    assert_eq!(refreshed.data, json!({"nombre": "Ana María"}));
    assert_eq!(remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_fetch_failure_serves_stale_copy() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("42");
    seed_both(&engine, &remote, &key, json!({"status": "open"}), 5);
    remote.fail_fetch.store(true, Ordering::SeqCst);

    let result = engine.read(&key, ReadOptions::refresh()).await.unwrap();
    assert!(result.is_stale());
    assert_eq!(result.data, json!({"status": "open"}));
    assert!(result.stale_reason.as_ref().unwrap().is_network());
    assert_eq!(engine.peek(&key).unwrap().state, EntryState::Stale);

    match result.into_fresh() {
      Err(SyncError::StaleData { key: stale_key, .. }) => assert_eq!(stale_key, key),
      other => panic!("expected StaleData, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_fetch_failure_without_cache_propagates() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("42");
    remote.seed(&key, json!({}), 1);
    remote.fail_fetch.store(true, Ordering::SeqCst);

    let err = engine.read(&key, ReadOptions::default()).await.unwrap_err();
    assert!(err.is_network());
    assert!(engine.peek(&key).is_none());
  }

  #[tokio::test]
  async fn test_not_found_drops_cached_copy() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("gone");
    engine
      .prime(&key, RemoteRecord::new(json!({"status": "open"}), 1))
      .unwrap();

    let err = engine.read(&key, ReadOptions::refresh()).await.unwrap_err();
    assert_eq!(err, SyncError::not_found(&key));
    assert!(engine.peek(&key).is_none());
  }

  #[tokio::test]
  async fn test_read_timeout_falls_back_to_cache() {
    let remote = Arc::new(ScriptedRemote::gated_fetch());
    let engine = engine(&remote);
    let cached = CacheKey::report("1");
    let missing = CacheKey::report("2");
    seed_both(&engine, &remote, &cached, json!({"status": "open"}), 1);

    let opts = ReadOptions::refresh().with_timeout(Duration::from_millis(20));
    let result = engine.read(&cached, opts).await.unwrap();
    assert!(result.is_stale());
    assert_eq!(result.version, 1);

    let err = engine.read(&missing, opts).await.unwrap_err();
    assert!(err.is_network());

    // The fetch itself keeps running and settles once the server answers
    remote.open_fetch(2);
    for _ in 0..100 {
      if !engine.is_fetching(&cached) && !engine.is_fetching(&missing) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!engine.is_fetching(&cached));
    let entry = engine.peek(&cached).unwrap();
    assert_eq!(entry.payload, json!({"status": "open"}));
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_slow_read_does_not_regress_confirmed_write() {
    let remote = Arc::new(ScriptedRemote::gated_fetch());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"status": "open"}), 1);

    // Read starts before the write and captures the version-1 server copy
    let read = engine.read(&key, ReadOptions::refresh());
    tokio::task::yield_now().await;
    assert_eq!(remote.fetch_calls(), 1);

    let written = engine
      .write(&key, json!({"status": "closed"}))
      .await
      .unwrap();
    assert_eq!(written.version, 2);

    remote.open_fetch(1);
    let result = read.await.unwrap();
    assert_eq!(result.version, 2);

    let entry = engine.peek(&key).unwrap();
    assert!(entry.version >= 2);
    assert_eq!(entry.payload, json!({"status": "closed"}));
  }

  #[tokio::test]
  async fn test_read_during_pending_write_keeps_optimistic_entry() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"status": "open"}), 1);

    let write = engine.write(&key, json!({"status": "closed"}));
    let read = engine.read(&key, ReadOptions::refresh()).await.unwrap();
    assert_eq!(read.version, 2);
    assert_eq!(read.data, json!({"status": "closed"}));
    assert_eq!(engine.peek(&key).unwrap().state, EntryState::Pending);

    remote.open_mutate(1);
    write.await.unwrap();
    let entry = engine.peek(&key).unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_optimistic_write_then_server_enrichment() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("42");
    seed_both(&engine, &remote, &key, json!({"status": "open"}), 5);

    let write = engine.write(&key, json!({"status": "closed"}));

    let optimistic = engine.peek(&key).unwrap();
    assert_eq!(optimistic.version, 6);
    assert_eq!(optimistic.payload, json!({"status": "closed"}));
    assert_eq!(optimistic.state, EntryState::Pending);
    assert_eq!(engine.pending_writes(&key).len(), 1);

    remote
      .mutate_responses
      .lock()
      .unwrap()
      .push_back(Ok(RemoteRecord::new(
        json!({"status": "closed", "closedAt": "t1"}),
        6,
      )));
    remote.open_mutate(1);

    let confirmed = write.await.unwrap();
    assert_eq!(confirmed.version, 6);
    assert_eq!(confirmed.payload, json!({"status": "closed", "closedAt": "t1"}));

    let entry = engine.peek(&key).unwrap();
    assert_eq!(entry.version, 6);
    assert_eq!(entry.payload, json!({"status": "closed", "closedAt": "t1"}));
    assert_eq!(entry.state, EntryState::Fresh);
    assert!(engine.pending_writes(&key).is_empty());
  }

  #[tokio::test]
  async fn test_failed_write_rolls_back_exactly() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("42");
    seed_both(&engine, &remote, &key, json!({"status": "open", "prioridad": "alta"}), 3);
    let before = engine.peek(&key).unwrap();
    remote.fail_mutate.store(true, Ordering::SeqCst);

    let err = engine
      .write(&key, json!({"status": "closed"}))
      .await
      .unwrap_err();
    assert!(err.is_network());

    let after = engine.peek(&key).unwrap();
    assert_eq!(after.version, 3);
    assert_eq!(
      serde_json::to_vec(&after.payload).unwrap(),
      serde_json::to_vec(&before.payload).unwrap()
    );
    assert_eq!(after.state, EntryState::Error);
  }

  #[tokio::test]
  async fn test_failed_write_on_absent_entry_deletes_it() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("new");
    remote.fail_mutate.store(true, Ordering::SeqCst);

    let write = engine.write(&key, json!({"titulo": "Poste caído"}));
    assert_eq!(engine.peek(&key).unwrap().version, 1);

    assert!(write.await.is_err());
    assert!(engine.peek(&key).is_none());
  }

  #[tokio::test]
  async fn test_writes_reach_server_in_invocation_order() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"status": "open"}), 1);

    let first = engine.write(&key, json!({"status": "in_progress"}));
    let second = engine.write(&key, json!({"status": "closed", "nota": "listo"}));

    let visible = engine.peek(&key).unwrap();
    assert_eq!(visible.version, 3);
    assert_eq!(visible.payload, json!({"status": "closed", "nota": "listo"}));

    remote.open_mutate(2);
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().version, 2);
    assert_eq!(b.unwrap().version, 3);

    let sent: Vec<Value> = remote
      .mutations
      .lock()
      .unwrap()
      .iter()
      .map(|(_, patch)| patch.clone())
      .collect();
    assert_eq!(
      sent,
      vec![
        json!({"status": "in_progress"}),
        json!({"status": "closed", "nota": "listo"})
      ]
    );
    assert_eq!(engine.peek(&key).unwrap().state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_failed_head_write_keeps_later_write() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"status": "open", "prioridad": "baja"}), 3);
    remote
      .mutate_responses
      .lock()
      .unwrap()
      .push_back(Err(SyncError::network(&key, "timeout")));

    let first = engine.write(&key, json!({"status": "closed"}));
    let second = engine.write(&key, json!({"prioridad": "alta"}));
    assert_eq!(engine.peek(&key).unwrap().version, 5);

    remote.open_mutate(2);
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_err());
    let confirmed = b.unwrap();
    assert_eq!(confirmed.version, 4);

    let entry = engine.peek(&key).unwrap();
    assert_eq!(entry.version, 4);
    assert_eq!(entry.payload, json!({"status": "open", "prioridad": "alta"}));
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_write_timeout_rolls_back_then_late_confirmation_lands() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"a": 1}), 3);

    let err = engine
      .write_with(&key, json!({"a": 2}), WriteOptions::timeout(Duration::from_millis(20)))
      .await
      .unwrap_err();
    assert!(err.is_network());

    let rolled_back = engine.peek(&key).unwrap();
    assert_eq!(rolled_back.version, 3);
    assert_eq!(rolled_back.payload, json!({"a": 1}));
    assert_eq!(rolled_back.state, EntryState::Error);

    // The request was already on the wire; its confirmation still applies
    remote.open_mutate(1);
    let entry = wait_for_version(&engine, &key, 4).await;
    assert_eq!(entry.payload, json!({"a": 2}));
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_timed_out_queued_write_is_never_sent() {
    let remote = Arc::new(ScriptedRemote::gated_mutate());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"a": 1}), 1);

    let first = engine.write(&key, json!({"a": 2}));
    let second = engine
      .write_with(&key, json!({"b": 1}), WriteOptions::timeout(Duration::from_millis(20)))
      .await;
    assert!(second.is_err());
    assert_eq!(engine.peek(&key).unwrap().payload, json!({"a": 2}));

    remote.open_mutate(2);
    assert_eq!(first.await.unwrap().version, 2);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(remote.mutation_count(), 1);
    let entry = engine.peek(&key).unwrap();
    assert_eq!(entry.payload, json!({"a": 2}));
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_invalidate_forces_fetch() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::project("7");
    remote.seed(&key, json!({"nombre": "Red Norte"}), 1);

    engine.read(&key, ReadOptions::default()).await.unwrap();
    engine.read(&key, ReadOptions::default()).await.unwrap();
    assert_eq!(remote.fetch_calls(), 1);

    engine.invalidate(&key);
    assert!(engine.peek(&key).is_none());

    let result = engine.read(&key, ReadOptions::default()).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_invalidate_detaches_running_fetch() {
    let remote = Arc::new(ScriptedRemote::gated_fetch());
    let engine = engine(&remote);
    let key = CacheKey::user("u1");
    remote.seed(&key, json!({"nombre": "Ana"}), 1);

    let before = engine.read(&key, ReadOptions::default());
    engine.invalidate(&key);
    let after = engine.read(&key, ReadOptions::default());

    remote.open_fetch(2);
    let (old, new) = tokio::join!(before, after);
    assert_eq!(old.unwrap().version, 1);
    assert_eq!(new.unwrap().version, 1);
    assert_eq!(remote.fetch_calls(), 2);
    assert_eq!(engine.peek(&key).unwrap().version, 1);
  }

  #[tokio::test]
  async fn test_invalidated_fetch_does_not_repopulate() {
    let remote = Arc::new(ScriptedRemote::gated_fetch());
    let engine = engine(&remote);
    let key = CacheKey::user("u1");
    remote.seed(&key, json!({"nombre": "Ana"}), 1);

    let read = engine.read(&key, ReadOptions::default());
    engine.invalidate(&key);
    remote.open_fetch(1);

    assert_eq!(read.await.unwrap().source, CacheSource::Network);
    assert!(engine.peek(&key).is_none());
  }

  #[tokio::test]
  async fn test_invalidate_by_type() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    for id in ["1", "2", "3"] {
      engine
        .prime(&CacheKey::report(id), RemoteRecord::new(json!({}), 1))
        .unwrap();
    }
    engine
      .prime(&CacheKey::project("7"), RemoteRecord::new(json!({}), 1))
      .unwrap();

    assert_eq!(engine.invalidate_by_type(EntityType::Report), 3);
    assert!(engine.list(EntityType::Report).is_empty());
    assert_eq!(engine.list(EntityType::Project).len(), 1);
  }

  #[tokio::test]
  async fn test_equal_version_divergence_is_conflict() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::report("42");
    engine
      .prime(&key, RemoteRecord::new(json!({"status": "open"}), 3))
      .unwrap();
    remote.seed(&key, json!({"status": "closed"}), 3);

    let err = engine.read(&key, ReadOptions::refresh()).await.unwrap_err();
    assert_eq!(
      err,
      SyncError::Conflict {
        key: key.clone(),
        version: 3
      }
    );
    assert_eq!(engine.peek(&key).unwrap().payload, json!({"status": "open"}));
  }

  #[tokio::test]
  async fn test_observed_versions_never_decrease() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    let key = CacheKey::project("7");
    let mut observed = Vec::new();

    engine.prime(&key, RemoteRecord::new(json!({"v": 5}), 5)).unwrap();
    observed.push(engine.peek(&key).unwrap().version);

    // An older server copy arrives late
    engine.prime(&key, RemoteRecord::new(json!({"v": 4}), 4)).unwrap();
    observed.push(engine.peek(&key).unwrap().version);

    remote.seed(&key, json!({"v": 5}), 5);
    engine.write(&key, json!({"v": 6})).await.unwrap();
    observed.push(engine.peek(&key).unwrap().version);

    engine.read(&key, ReadOptions::refresh()).await.unwrap();
    observed.push(engine.peek(&key).unwrap().version);

    assert_eq!(observed, vec![5, 5, 6, 6]);
    assert_eq!(engine.peek(&key).unwrap().payload, json!({"v": 6}));
  }

  #[tokio::test]
  async fn test_read_after_server_commit_does_not_replay_write() {
    let remote = Arc::new(ScriptedRemote::gated_response());
    let engine = engine(&remote);
    let key = CacheKey::report("1");
    seed_both(&engine, &remote, &key, json!({"a": 1}), 1);
    let mut observed = vec![engine.peek(&key).unwrap().version];

    let write = engine.write(&key, json!({"a": 2}));
    observed.push(engine.peek(&key).unwrap().version);

    // The server has applied the patch but not answered yet
    for _ in 0..100 {
      if remote.version_of(&key) == Some(2) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(remote.version_of(&key), Some(2));

    let read = engine.read(&key, ReadOptions::refresh()).await.unwrap();
    assert_eq!(read.version, 2);
    assert_eq!(read.data, json!({"a": 2}));
    observed.push(engine.peek(&key).unwrap().version);

    remote.open_response(1);
    let confirmed = write.await.unwrap();
    assert_eq!(confirmed.version, 2);
    observed.push(engine.peek(&key).unwrap().version);

    assert_eq!(observed, vec![1, 2, 2, 2]);
    let entry = engine.peek(&key).unwrap();
    assert_eq!(entry.payload, json!({"a": 2}));
    assert_eq!(entry.state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_unconfirmed_rows_from_earlier_session_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let written = CacheKey::report("42");
    let read = CacheKey::report("43");

    {
      let persistence = Arc::new(SqlitePersistence::open(Some(&path)).unwrap());
      let store = LocalStore::open(persistence);
      store.put(
        CacheEntry::new(written.clone(), json!({"status": "closed"}), 6, 60_000)
          .with_state(EntryState::Pending),
      );
      store.put(
        CacheEntry::new(read.clone(), json!({"nota": "local"}), 3, 60_000)
          .with_state(EntryState::Pending),
      );
    }

    let persistence = Arc::new(SqlitePersistence::open(Some(&path)).unwrap());
    let store = Arc::new(LocalStore::open(persistence));
    assert_eq!(store.get(&written).unwrap().state, EntryState::Pending);

    let remote = Arc::new(ScriptedRemote::default());
    remote.seed(&written, json!({"status": "open"}), 5);
    remote.seed(&read, json!({"nota": "server"}), 2);
    let dyn_remote: Arc<dyn Remote> = remote.clone();
    let engine = SyncEngine::new(store, dyn_remote);

    let confirmed = engine
      .write(&written, json!({"priority": "high"}))
      .await
      .unwrap();
    assert_eq!(confirmed.version, 6);
    assert_eq!(confirmed.payload, json!({"status": "open", "priority": "high"}));
    assert_eq!(engine.peek(&written).unwrap().state, EntryState::Fresh);

    let result = engine.read(&read, ReadOptions::refresh()).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.version, 2);
    assert_eq!(result.data, json!({"nota": "server"}));
    assert_eq!(engine.peek(&read).unwrap().state, EntryState::Fresh);
  }

  #[tokio::test]
  async fn test_read_list_populates_entries() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    remote.seed(&CacheKey::report("1"), json!({"proyectoId": "7"}), 1);
    remote.seed(&CacheKey::report("2"), json!({"proyectoId": "8"}), 2);
    remote.seed(&CacheKey::project("7"), json!({"nombre": "Red Norte"}), 1);
    // Diverges from the server at the same version
    engine
      .prime(&CacheKey::report("2"), RemoteRecord::new(json!({"proyectoId": "9"}), 2))
      .unwrap();

    let listed = engine
      .read_list(&ListQuery::all(EntityType::Report), None)
      .await
      .unwrap();
    assert_eq!(listed.source, CacheSource::Network);
    assert!(!listed.is_stale());
    assert_eq!(listed.entries.len(), 2);
    assert_eq!(listed.entries[1].payload, json!({"proyectoId": "9"}));

    let fetched = engine.peek(&CacheKey::report("1")).unwrap();
    assert_eq!(fetched.state, EntryState::Fresh);
    assert_eq!(engine.list(EntityType::Report).len(), 2);
    assert!(engine.list(EntityType::Project).is_empty());

    // Listed members are now served without a fetch
    let cached = engine
      .read(&CacheKey::report("1"), ReadOptions::default())
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::CacheFresh);
    assert_eq!(remote.fetch_calls(), 0);
  }

  #[tokio::test]
  async fn test_read_list_scoped_to_project() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    remote.seed(&CacheKey::report("1"), json!({"proyectoId": "7"}), 1);
    remote.seed(&CacheKey::report("2"), json!({"proyectoId": "8"}), 1);

    let listed = engine
      .read_list(&ListQuery::reports_for_project("7"), None)
      .await
      .unwrap();
    assert_eq!(listed.entries.len(), 1);
    assert_eq!(listed.entries[0].key, CacheKey::report("1"));
    assert!(engine.peek(&CacheKey::report("2")).is_none());
  }

  #[tokio::test]
  async fn test_read_list_failure_serves_cached_members() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);
    engine
      .prime(&CacheKey::report("1"), RemoteRecord::new(json!({"proyectoId": "7"}), 1))
      .unwrap();
    remote.fail_fetch.store(true, Ordering::SeqCst);

    let listed = engine
      .read_list(&ListQuery::reports_for_project("7"), None)
      .await
      .unwrap();
    assert!(listed.is_stale());
    assert_eq!(listed.source, CacheSource::CacheStale);
    assert_eq!(listed.entries.len(), 1);
    assert!(listed.stale_reason.unwrap().is_network());

    let err = engine
      .read_list(&ListQuery::reports_for_project("9"), None)
      .await
      .unwrap_err();
    assert!(err.is_network());
  }

  #[tokio::test]
  async fn test_create_caches_server_assigned_key() {
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&remote);

    let created = engine
      .create(EntityType::Report, json!({"titulo": "Poste caído", "proyectoId": "7"}))
      .await
      .unwrap();
    assert_eq!(created.key, CacheKey::report("srv-1"));
    assert_eq!(created.version, 1);

    let cached = engine.peek(&created.key).unwrap();
    assert_eq!(cached.state, EntryState::Fresh);
    assert_eq!(cached.payload, json!({"titulo": "Poste caído", "proyectoId": "7"}));

    remote.fail_mutate.store(true, Ordering::SeqCst);
    let err = engine
      .create(EntityType::Report, json!({"titulo": "Otro"}))
      .await
      .unwrap_err();
    assert!(err.is_network());
    assert_eq!(engine.list(EntityType::Report).len(), 1);
  }
}
