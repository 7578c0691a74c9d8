//! Cache layer that orchestrates caching logic with backend fetching.

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::storage::CacheStorage;
use super::traits::{CacheResult, QueryKey};
use crate::error::Result;
use crate::query::collection_prefix;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Cache layer that manages typed cache access and retried fetching.
///
/// This layer sits between the sync manager and the backend, providing
/// cache-first reads for data that changes rarely.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// TTL used when a caller does not pass one
  default_ttl: Duration,
  retry: RetryPolicy,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  /// Create a cache layer over storage that is shared with other owners.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      default_ttl: Duration::from_secs(5 * 60),
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  /// Serialized value under `key`, if present and unexpired.
  pub fn get_raw<K: QueryKey + ?Sized>(&self, key: &K) -> Result<Option<String>> {
    self.storage.get(&key.cache_hash())
  }

  /// Typed value under `key`. An entry that no longer decodes is evicted.
  pub fn get<T, K>(&self, key: &K) -> Result<Option<T>>
  where
    T: DeserializeOwned,
    K: QueryKey + ?Sized,
  {
    let hash = key.cache_hash();
    let Some(raw) = self.storage.get(&hash)? else {
      return Ok(None);
    };

    match serde_json::from_str(&raw) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        tracing::warn!("Dropping undecodable cache entry for {}: {}", key.description(), e);
        self.storage.clear(Some(&hash))?;
        Ok(None)
      }
    }
  }

  pub fn put_raw<K: QueryKey + ?Sized>(&self, key: &K, raw: String, ttl: Duration) -> Result<()> {
    self.storage.set(&key.cache_hash(), raw, ttl)
  }

  pub fn put<T, K>(&self, key: &K, value: &T, ttl: Duration) -> Result<()>
  where
    T: Serialize + ?Sized,
    K: QueryKey + ?Sized,
  {
    let raw = serde_json::to_string(value)?;
    self.put_raw(key, raw, ttl)
  }

  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> Result<()> {
    self.storage.clear(Some(&key.cache_hash()))
  }

  /// Drop every cached query on `collection`.
  pub fn invalidate_collection(&self, collection: &str) -> Result<usize> {
    let removed = self.storage.clear_prefix(&collection_prefix(collection))?;
    if removed > 0 {
      tracing::debug!("Invalidated {} cached queries on {}", removed, collection);
    }
    Ok(removed)
  }

  pub fn clear(&self) -> Result<()> {
    self.storage.clear(None)
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Check cache - if unexpired, return immediately
  /// 2. On a miss, fetch from the backend under the retry policy
  /// 3. Store the result with `ttl` (or the default TTL)
  pub async fn fetch<T, K, F, Fut>(
    &self,
    key: &K,
    ttl: Option<Duration>,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    K: QueryKey + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(cached) = self.get::<T, K>(key)? {
      tracing::trace!("Cache hit for {}", key.description());
      return Ok(CacheResult::from_cache(cached));
    }

    let data = retry_with_backoff(&self.retry, fetcher).await?;
    self.put(key, &data, ttl.unwrap_or(self.default_ttl))?;
    Ok(CacheResult::from_network(data))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      default_ttl: self.default_ttl,
      retry: self.retry,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, TtlCache};
  use crate::error::SyncError;
  use crate::query::QuerySpec;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[tokio::test(start_paused = true)]
  async fn test_fetch_is_cache_first() {
    let layer = CacheLayer::new(TtlCache::new(16));
    let query = QuerySpec::collection("classes").where_eq("teacherId", "t1");
    let calls = AtomicU32::new(0);

    let first = layer
      .fetch(&query, Some(Duration::from_secs(5)), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec!["c1".to_string()]) }
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second: CacheResult<Vec<String>> = layer
      .fetch(&query, Some(Duration::from_secs(5)), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec!["changed".to_string()]) }
      })
      .await
      .unwrap();
    assert!(second.is_cached());
    assert_eq!(second.data, vec!["c1".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let third: CacheResult<Vec<String>> = layer
      .fetch(&query, Some(Duration::from_secs(5)), || async {
        Ok(vec!["changed".to_string()])
      })
      .await
      .unwrap();
    assert_eq!(third.source, CacheSource::Network);
    assert_eq!(third.data, vec!["changed".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_retries_transient_errors_and_skips_cache_on_failure() {
    let layer =
      CacheLayer::new(TtlCache::new(16)).with_retry(RetryPolicy::new(2, Duration::from_millis(50)));
    let calls = AtomicU32::new(0);

    let result: Result<CacheResult<Vec<u32>>> = layer
      .fetch("profiles:u1", None, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(SyncError::Unavailable("offline".into())) }
      })
      .await;

    assert!(matches!(result, Err(SyncError::Unavailable(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(layer.get_raw("profiles:u1").unwrap(), None);
  }

  #[tokio::test]
  async fn test_invalidate_collection_leaves_other_collections() {
    let layer = CacheLayer::new(TtlCache::new(16));
    let assignments = QuerySpec::collection("assignments").where_eq("classId", "c1");
    let classes = QuerySpec::collection("classes");

    layer.put(&assignments, &vec![1, 2], Duration::from_secs(60)).unwrap();
    layer.put(&classes, &vec![3], Duration::from_secs(60)).unwrap();

    assert_eq!(layer.invalidate_collection("assignments").unwrap(), 1);
    assert_eq!(layer.get::<Vec<i32>, _>(&assignments).unwrap(), None);
    assert_eq!(layer.get::<Vec<i32>, _>(&classes).unwrap(), Some(vec![3]));
  }

  #[tokio::test]
  async fn test_undecodable_entry_is_dropped() {
    let layer = CacheLayer::new(TtlCache::new(4));
    layer
      .put_raw("classes:x", "not json".to_string(), Duration::from_secs(60))
      .unwrap();
    assert_eq!(layer.get::<Vec<String>, _>("classes:x").unwrap(), None);
    assert_eq!(layer.get_raw("classes:x").unwrap(), None);
  }
}
