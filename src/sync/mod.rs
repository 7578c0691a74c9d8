//! Real-time data manager.
//!
//! [`SyncManager`] ties a [`Backend`] to a [`CacheLayer`] and hands out
//! change-detecting subscriptions, pollable live queries and cached,
//! retried one-shot reads.

mod live;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::backend::Backend;
use crate::cache::{CacheLayer, CacheResult, CacheStorage, TtlCache};
use crate::error::{Result, SyncError};
use crate::query::QuerySpec;
use crate::retry::retry_with_backoff;

pub use live::{LiveQuery, QueryState};
pub use watch::{Subscription, Transform, Update, WatchOptions};

pub(crate) use watch::decode_records;

pub struct SyncManager<S: CacheStorage = TtlCache> {
  backend: Arc<dyn Backend>,
  cache: CacheLayer<S>,
}

impl<S: CacheStorage + 'static> SyncManager<S> {
  pub fn new(backend: Arc<dyn Backend>, cache: CacheLayer<S>) -> Self {
    Self { backend, cache }
  }

  pub fn backend(&self) -> &Arc<dyn Backend> {
    &self.backend
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  /// Subscribe to `query`; `callback` runs on a background task whenever the
  /// decoded result set changes. Must be called inside a tokio runtime.
  pub fn subscribe<T, F>(&self, query: QuerySpec, options: WatchOptions<T>, callback: F) -> Subscription
  where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: FnMut(Update<T>) + Send + 'static,
  {
    watch::subscribe(
      Arc::clone(&self.backend),
      self.cache.clone(),
      query,
      options,
      callback,
    )
  }

  /// Subscribe to `query` and return a handle that can be polled from an event loop.
  pub fn live<T>(&self, query: QuerySpec, options: WatchOptions<T>) -> LiveQuery<T>
  where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
  {
    let (tx, rx) = tokio::sync::watch::channel(None);
    let subscription = self.subscribe(query, options, move |update| {
      tx.send_replace(Some(update));
    });
    LiveQuery::new(subscription, rx)
  }

  /// One-shot read of `query` under the retry policy.
  ///
  /// With a `ttl` the result is served from and stored in the cache;
  /// without one the backend is always asked.
  pub async fn read<T>(&self, query: &QuerySpec, ttl: Option<Duration>) -> Result<CacheResult<Vec<T>>>
  where
    T: Serialize + DeserializeOwned,
  {
    let backend = &self.backend;
    let fetch = || async move {
      let docs = backend.get_documents(query).await?;
      Ok::<_, SyncError>(decode_records::<T>(docs))
    };

    match ttl {
      Some(ttl) => self.cache.fetch(query, Some(ttl), fetch).await,
      None => retry_with_backoff(self.cache.retry_policy(), fetch)
        .await
        .map(CacheResult::from_network),
    }
  }

  /// One-shot read of a single document under the retry policy.
  pub async fn read_one<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
    let backend = &self.backend;
    let doc = retry_with_backoff(self.cache.retry_policy(), || async move {
      backend.get_document(collection, id).await
    })
    .await?;

    doc
      .map(|d| serde_json::from_value(d.data).map_err(Into::into))
      .transpose()
  }

  /// Drop cached queries on `collection` after a write to it.
  pub fn invalidate(&self, collection: &str) {
    if let Err(e) = self.cache.invalidate_collection(collection) {
      tracing::warn!("Failed to invalidate cache for {}: {}", collection, e);
    }
  }
}

impl<S: CacheStorage> Clone for SyncManager<S> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      cache: self.cache.clone(),
    }
  }
}
