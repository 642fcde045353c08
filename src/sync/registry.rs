//! Single-flight de-duplication of concurrent fetches.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

use super::lock;
use crate::cache::CacheKey;
use crate::error::{SyncError, SyncResult};

/// A handle every subscriber of one in-flight request awaits.
pub type Waiter<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

struct InFlight<T> {
  generation: u64,
  waiter: Waiter<T>,
  started_at: Instant,
  subscribers: usize,
}

struct Requests<T> {
  by_key: HashMap<CacheKey, InFlight<T>>,
  next_generation: u64,
}

/// Collapses concurrent requests for the same key into one producer run.
///
/// The producer runs on its own task, so it always completes even if
/// every subscriber stops awaiting. Its outcome is cloned to all of them.
pub struct InFlightRegistry<T> {
  requests: Arc<Mutex<Requests<T>>>,
}

impl<T> InFlightRegistry<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      requests: Arc::new(Mutex::new(Requests {
        by_key: HashMap::new(),
        next_generation: 0,
      })),
    }
  }

  /// Attach to the running request for `key`, or start one with `producer`.
  ///
  /// `producer` is invoked at most once per outstanding request; later
  /// callers get a waiter on the same result. Must be called inside a
  /// tokio runtime.
  pub fn get_or_start<F, Fut>(&self, key: &CacheKey, producer: F) -> Waiter<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
  {
    let mut requests = lock(&self.requests);

    if let Some(request) = requests.by_key.get_mut(key) {
      request.subscribers += 1;
      debug!(%key, subscribers = request.subscribers, "Joining in-flight request");
      return request.waiter.clone();
    }

    let generation = requests.next_generation;
    requests.next_generation += 1;

    let (tx, rx) = oneshot::channel();
    let work = producer();
    let registry = Arc::clone(&self.requests);
    let task_key = key.clone();

    tokio::spawn(async move {
      let result = work.await;
      {
        let mut requests = lock(&registry);
        let ours = requests
          .by_key
          .get(&task_key)
          .is_some_and(|r| r.generation == generation);
        if ours {
          if let Some(done) = requests.by_key.remove(&task_key) {
            debug!(
              key = %task_key,
              subscribers = done.subscribers,
              elapsed_ms = done.started_at.elapsed().as_millis() as u64,
              "In-flight request settled"
            );
          }
        }
      }
      // Every subscriber may be gone already
      let _ = tx.send(result);
    });

    let abort_key = key.clone();
    let waiter = rx
      .map(move |received| {
        received
          .unwrap_or_else(|_| Err(SyncError::network(&abort_key, "in-flight request aborted")))
      })
      .boxed()
      .shared();

    debug!(%key, "Starting in-flight request");
    requests.by_key.insert(
      key.clone(),
      InFlight {
        generation,
        waiter: waiter.clone(),
        started_at: Instant::now(),
        subscribers: 1,
      },
    );

    waiter
  }

  /// Detach the running request for `key` so the next caller starts a new one.
  ///
  /// The detached request still runs to completion for its own subscribers.
  pub fn forget(&self, key: &CacheKey) -> bool {
    lock(&self.requests).by_key.remove(key).is_some()
  }

  /// Detach every running request whose key matches `predicate`.
  pub fn forget_matching(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
    let mut requests = lock(&self.requests);
    let before = requests.by_key.len();
    requests.by_key.retain(|key, _| !predicate(key));
    before - requests.by_key.len()
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    lock(&self.requests).by_key.contains_key(key)
  }

  pub fn len(&self) -> usize {
    lock(&self.requests).by_key.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T> Default for InFlightRegistry<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}
