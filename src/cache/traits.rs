//! Core traits and types for the caching system.

/// Anything that can be turned into a stable cache key.
///
/// Keys have the form `<collection>:<hash>` so that every cached query on a
/// collection can be invalidated at once.
pub trait QueryKey {
  /// Stable, fixed-length key used for storage lookups.
  fn cache_hash(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;
}

impl QueryKey for str {
  fn cache_hash(&self) -> String {
    self.to_string()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_hash(&self) -> String {
    self.clone()
  }

  fn description(&self) -> String {
    self.clone()
  }
}

/// Result from a cache operation, including data and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh backend data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from an unexpired cache entry.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the backend (one-shot read or live snapshot)
  Network,
  /// Data from cache, within its TTL
  Cache,
}
