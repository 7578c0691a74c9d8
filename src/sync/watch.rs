//! Change-detecting live query subscriptions.
//!
//! Each subscription runs two tasks joined by a single-slot `watch` channel:
//!
//! - the reader consumes the backend's snapshot stream, decodes and
//!   serializes each result set, and publishes it only when the serialization
//!   differs from the last published one
//! - the deliverer invokes the consumer callback with the latest published
//!   update
//!
//! A slow callback never blocks the reader; updates published meanwhile
//! replace each other and only the newest is delivered.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{Backend, Document};
use crate::cache::{CacheLayer, CacheSource, CacheStorage, QueryKey};
use crate::error::SyncError;
use crate::query::QuerySpec;

/// Record transform applied after decoding.
pub type Transform<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// A result set delivered to a subscriber.
///
/// On a subscription error `records` is empty and `error` says why, so
/// callers that only render data keep working and callers that care can
/// tell "no data" from "no access".
#[derive(Debug)]
pub struct Update<T> {
  pub records: Arc<Vec<T>>,
  pub error: Option<SyncError>,
  pub source: CacheSource,
}

impl<T> Clone for Update<T> {
  fn clone(&self) -> Self {
    Self {
      records: Arc::clone(&self.records),
      error: self.error.clone(),
      source: self.source,
    }
  }
}

impl<T> Update<T> {
  fn live(records: Vec<T>, error: Option<SyncError>) -> Self {
    Self {
      records: Arc::new(records),
      error,
      source: CacheSource::Network,
    }
  }

  fn cached(records: Vec<T>) -> Self {
    Self {
      records: Arc::new(records),
      error: None,
      source: CacheSource::Cache,
    }
  }

  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }

  pub fn into_result(self) -> Result<Arc<Vec<T>>, SyncError> {
    match self.error {
      Some(e) => Err(e),
      None => Ok(self.records),
    }
  }
}

/// How a subscription should behave.
pub struct WatchOptions<T> {
  /// Serve an unexpired cached result instead of opening a live subscription,
  /// and cache live results for the next subscriber.
  pub is_static: bool,
  /// TTL for cached results; the cache layer default when `None`.
  pub ttl: Option<Duration>,
  pub transform: Option<Transform<T>>,
}

impl<T> Default for WatchOptions<T> {
  fn default() -> Self {
    Self {
      is_static: false,
      ttl: None,
      transform: None,
    }
  }
}

impl<T> Clone for WatchOptions<T> {
  fn clone(&self) -> Self {
    Self {
      is_static: self.is_static,
      ttl: self.ttl,
      transform: self.transform.clone(),
    }
  }
}

impl<T> WatchOptions<T> {
  /// Always-live subscription.
  pub fn live() -> Self {
    Self::default()
  }

  /// Static subscription cached for `ttl`.
  pub fn cached(ttl: Duration) -> Self {
    Self {
      is_static: true,
      ttl: Some(ttl),
      transform: None,
    }
  }

  pub fn with_transform<F>(mut self, transform: F) -> Self
  where
    F: Fn(T) -> T + Send + Sync + 'static,
  {
    self.transform = Some(Arc::new(transform));
    self
  }
}

thread_local! {
  /// Gate whose callback is running on this thread, 0 when none.
  static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Liveness flag plus the lock every callback invocation runs under.
///
/// Closing takes the same lock, so once `close` returns no callback is in
/// flight and none will start.
struct Gate {
  alive: AtomicBool,
  lock: Mutex<()>,
}

impl Gate {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      alive: AtomicBool::new(true),
      lock: Mutex::new(()),
    })
  }

  fn id(&self) -> usize {
    self as *const Self as usize
  }

  fn is_open(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  /// Runs `f` while the gate is open. Returns false once it has closed.
  fn deliver(&self, f: impl FnOnce()) -> bool {
    let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
    if !self.is_open() {
      return false;
    }

    let _restore = RestoreDelivering(DELIVERING.with(|d| d.replace(self.id())));
    f();
    true
  }

  /// Returns whether this call closed the gate.
  fn close(&self) -> bool {
    if !self.alive.swap(false, Ordering::SeqCst) {
      return false;
    }
    // A callback stopping its own subscription already holds the lock.
    if DELIVERING.with(Cell::get) != self.id() {
      drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
    }
    true
  }
}

struct RestoreDelivering(usize);

impl Drop for RestoreDelivering {
  fn drop(&mut self) {
    DELIVERING.with(|d| d.set(self.0));
  }
}

/// Handle to a running subscription.
///
/// Stopping is idempotent and also happens on drop. Once `stop` returns, the
/// callback is not running and is not invoked again.
pub struct Subscription {
  gate: Arc<Gate>,
  tasks: Vec<JoinHandle<()>>,
  description: String,
}

impl Subscription {
  /// Blocks while a callback is running on another thread.
  pub fn stop(&self) {
    if self.gate.close() {
      for task in &self.tasks {
        task.abort();
      }
      tracing::debug!("Stopped subscription to {}", self.description);
    }
  }

  pub fn is_active(&self) -> bool {
    self.gate.is_open()
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.stop();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("description", &self.description)
      .field("active", &self.is_active())
      .finish_non_exhaustive()
  }
}

/// Decode documents into records, skipping any that do not fit `T`.
pub(crate) fn decode_records<T: DeserializeOwned>(docs: Vec<Document>) -> Vec<T> {
  docs
    .into_iter()
    .filter_map(|doc| match serde_json::from_value::<T>(doc.data) {
      Ok(record) => Some(record),
      Err(e) => {
        tracing::warn!("Skipping document {}: {}", doc.id, e);
        None
      }
    })
    .collect()
}

fn apply_transform<T>(records: Vec<T>, transform: Option<&Transform<T>>) -> Vec<T> {
  match transform {
    Some(f) => records.into_iter().map(|r| f(r)).collect(),
    None => records,
  }
}

fn serialize<T: Serialize>(records: &[T], description: &str) -> Option<String> {
  match serde_json::to_string(records) {
    Ok(s) => Some(s),
    Err(e) => {
      tracing::warn!("Cannot serialize snapshot of {}: {}", description, e);
      None
    }
  }
}

pub(crate) fn subscribe<T, F, S>(
  backend: Arc<dyn Backend>,
  cache: CacheLayer<S>,
  query: QuerySpec,
  options: WatchOptions<T>,
  mut callback: F,
) -> Subscription
where
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  F: FnMut(Update<T>) + Send + 'static,
  S: CacheStorage + 'static,
{
  let gate = Gate::new();
  let description = query.description();

  if options.is_static {
    match cache.get::<Vec<T>, _>(&query) {
      Ok(Some(records)) => {
        tracing::debug!("Serving {} from cache", description);
        let deliver_gate = Arc::clone(&gate);
        let transform = options.transform.clone();
        let task = tokio::spawn(async move {
          let records = apply_transform(records, transform.as_ref());
          deliver_gate.deliver(|| callback(Update::cached(records)));
        });
        return Subscription {
          gate,
          tasks: vec![task],
          description,
        };
      }
      Ok(None) => {}
      Err(e) => tracing::warn!("Cache lookup for {} failed: {}", description, e),
    }
  }

  let (tx, mut rx) = watch::channel::<Option<Update<T>>>(None);

  let deliver_gate = Arc::clone(&gate);
  let deliverer = tokio::spawn(async move {
    while rx.changed().await.is_ok() {
      let Some(update) = rx.borrow_and_update().clone() else {
        continue;
      };
      if !deliver_gate.deliver(|| callback(update)) {
        break;
      }
    }
  });

  let reader_gate = Arc::clone(&gate);
  let reader_description = description.clone();
  let reader = tokio::spawn(async move {
    let ttl = options.ttl.unwrap_or_else(|| cache.default_ttl());
    let mut stream = backend.listen(&query);
    let mut last_fingerprint: Option<String> = None;

    while let Some(snapshot) = stream.next().await {
      if !reader_gate.is_open() {
        break;
      }

      let (records, error) = match snapshot {
        Ok(docs) => (decode_records::<T>(docs), None),
        Err(e) => {
          tracing::warn!("Subscription to {} failed: {}", reader_description, e);
          (Vec::new(), Some(e))
        }
      };

      // The cache is shared by subscribers with other transforms, so it holds
      // records as decoded.
      let caching = options.is_static && error.is_none();
      let untransformed = match &options.transform {
        Some(_) if caching => serialize(&records, &reader_description),
        _ => None,
      };
      let records = apply_transform(records, options.transform.as_ref());
      let Some(serialized) = serialize(&records, &reader_description) else {
        continue;
      };
      let fingerprint = match &error {
        Some(e) => format!("{:?}|{}", e.kind(), serialized),
        None => serialized.clone(),
      };

      if last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
        tracing::trace!("Unchanged snapshot of {} suppressed", reader_description);
        continue;
      }
      last_fingerprint = Some(fingerprint);

      if caching {
        let entry = match &options.transform {
          Some(_) => untransformed,
          None => Some(serialized),
        };
        if let Some(entry) = entry {
          if let Err(e) = cache.put_raw(&query, entry, ttl) {
            tracing::warn!("Failed to cache {}: {}", reader_description, e);
          }
        }
      }

      if tx.send(Some(Update::live(records, error))).is_err() {
        break;
      }
    }

    tracing::debug!("Snapshot stream for {} ended", reader_description);
  });

  tracing::debug!("Subscribed to {}", description);
  Subscription {
    gate,
    tasks: vec![reader, deliverer],
    description,
  }
}
