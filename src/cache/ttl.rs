//! Bounded in-memory TTL cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::storage::CacheStorage;
use crate::error::{Result, SyncError};

struct Entry {
  data: String,
  stored_at: Instant,
  ttl: Duration,
}

impl Entry {
  fn is_expired(&self, now: Instant) -> bool {
    now.duration_since(self.stored_at) > self.ttl
  }
}

/// In-memory cache with per-entry TTL and a fixed capacity.
///
/// Constructed explicitly and shared by `Arc`; there is no process-wide
/// instance. When full, expired entries are purged first, then the oldest
/// entry is evicted.
pub struct TtlCache {
  entries: Mutex<HashMap<String, Entry>>,
  capacity: usize,
}

impl TtlCache {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      capacity: capacity.max(1),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Drop every expired entry. Returns how many were removed.
  pub fn purge_expired(&self) -> Result<usize> {
    let mut entries = self.lock()?;
    Ok(Self::purge_locked(&mut entries, Instant::now()))
  }

  fn purge_locked(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now));
    before - entries.len()
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
    self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl Default for TtlCache {
  fn default() -> Self {
    Self::new(1024)
  }
}

impl CacheStorage for TtlCache {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let mut entries = self.lock()?;
    let now = Instant::now();

    let expired = match entries.get(key) {
      Some(entry) => entry.is_expired(now),
      None => return Ok(None),
    };

    if expired {
      entries.remove(key);
      tracing::trace!("Evicted expired cache entry {}", key);
      return Ok(None);
    }

    Ok(entries.get(key).map(|entry| entry.data.clone()))
  }

  fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
    let mut entries = self.lock()?;
    let now = Instant::now();

    if !entries.contains_key(key) && entries.len() >= self.capacity {
      let purged = Self::purge_locked(&mut entries, now);
      if purged == 0 {
        let oldest = entries
          .iter()
          .min_by_key(|(_, e)| e.stored_at)
          .map(|(k, _)| k.clone());
        if let Some(oldest) = oldest {
          tracing::debug!("Cache full ({} entries), evicting {}", self.capacity, oldest);
          entries.remove(&oldest);
        }
      }
    }

    entries.insert(
      key.to_string(),
      Entry {
        data: value,
        stored_at: now,
        ttl,
      },
    );
    Ok(())
  }

  fn clear(&self, key: Option<&str>) -> Result<()> {
    let mut entries = self.lock()?;
    match key {
      Some(key) => {
        entries.remove(key);
      }
      None => entries.clear(),
    }
    Ok(())
  }

  fn clear_prefix(&self, prefix: &str) -> Result<usize> {
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|k, _| !k.starts_with(prefix));
    Ok(before - entries.len())
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_entry_served_until_ttl_then_evicted() {
    let cache = TtlCache::new(8);
    cache
      .set("classes:k", "[\"c1\"]".to_string(), Duration::from_millis(5000))
      .unwrap();

    tokio::time::advance(Duration::from_millis(5000)).await;
    assert_eq!(cache.get("classes:k").unwrap().as_deref(), Some("[\"c1\"]"));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(cache.get("classes:k").unwrap(), None);
    assert_eq!(cache.len().unwrap(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_capacity_evicts_oldest() {
    let cache = TtlCache::new(2);
    cache.set("a", "1".into(), Duration::from_secs(60)).unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    cache.set("b", "2".into(), Duration::from_secs(60)).unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    cache.set("c", "3".into(), Duration::from_secs(60)).unwrap();

    assert_eq!(cache.len().unwrap(), 2);
    assert_eq!(cache.get("a").unwrap(), None);
    assert_eq!(cache.get("c").unwrap().as_deref(), Some("3"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_capacity_prefers_purging_expired() {
    let cache = TtlCache::new(2);
    cache.set("old", "1".into(), Duration::from_secs(60)).unwrap();
    cache.set("short", "2".into(), Duration::from_millis(5)).unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    cache.set("new", "3".into(), Duration::from_secs(60)).unwrap();

    assert_eq!(cache.get("old").unwrap().as_deref(), Some("1"));
    assert_eq!(cache.get("new").unwrap().as_deref(), Some("3"));
  }

  #[tokio::test]
  async fn test_clear_by_key_prefix_and_all() {
    let cache = TtlCache::default();
    for key in ["assignments:1", "assignments:2", "classes:1"] {
      cache.set(key, "x".into(), Duration::from_secs(60)).unwrap();
    }

    cache.clear(Some("classes:1")).unwrap();
    assert_eq!(cache.get("classes:1").unwrap(), None);

    assert_eq!(cache.clear_prefix("assignments:").unwrap(), 2);
    cache.set("classes:2", "y".into(), Duration::from_secs(60)).unwrap();
    cache.clear(None).unwrap();
    assert!(cache.is_empty().unwrap());
  }
}
