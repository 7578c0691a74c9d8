//! Cache storage trait, a no-op backend and a SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SyncError};

/// Trait for cache storage backends.
///
/// Values are stored as serialized strings; typing happens in
/// [`CacheLayer`](super::CacheLayer). Every backend honors the same expiry
/// rule: an entry is served while `now - stored_at <= ttl` and evicted on the
/// first lookup after that.
pub trait CacheStorage: Send + Sync {
  /// Get an unexpired value, evicting it if it has expired.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store a value with the current time as its timestamp.
  fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

  /// Remove one entry, or every entry when `key` is `None`.
  fn clear(&self, key: Option<&str>) -> Result<()>;

  /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
  fn clear_prefix(&self, prefix: &str) -> Result<usize>;

  /// Number of stored entries, expired ones included until they are evicted.
  fn len(&self) -> Result<usize>;

  fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear(&self, _key: Option<&str>) -> Result<()> {
    Ok(())
  }

  fn clear_prefix(&self, _prefix: &str) -> Result<usize> {
    Ok(0)
  }

  fn len(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage, for caches that outlive the process.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ttl_cache (
    cache_key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);
"#;

impl SqliteStorage {
  /// Open the cache at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Cache that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("classync").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;

    let row: Option<(String, i64, i64)> = conn
      .query_row(
        "SELECT data, stored_at, ttl_ms FROM ttl_cache WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    let Some((data, stored_at, ttl_ms)) = row else {
      return Ok(None);
    };

    if Utc::now().timestamp_millis() - stored_at > ttl_ms {
      conn.execute("DELETE FROM ttl_cache WHERE cache_key = ?", params![key])?;
      tracing::trace!("Evicted expired cache entry {}", key);
      return Ok(None);
    }

    Ok(Some(data))
  }

  fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
    let conn = self.lock()?;
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

    conn
      .execute(
        "INSERT OR REPLACE INTO ttl_cache (cache_key, data, stored_at, ttl_ms)
         VALUES (?, ?, ?, ?)",
        params![key, value, Utc::now().timestamp_millis(), ttl_ms],
      )
      .map_err(|e| SyncError::Storage(format!("Failed to store cache entry: {}", e)))?;

    Ok(())
  }

  fn clear(&self, key: Option<&str>) -> Result<()> {
    let conn = self.lock()?;
    match key {
      Some(key) => conn.execute("DELETE FROM ttl_cache WHERE cache_key = ?", params![key])?,
      None => conn.execute("DELETE FROM ttl_cache", [])?,
    };
    Ok(())
  }

  fn clear_prefix(&self, prefix: &str) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM ttl_cache WHERE substr(cache_key, 1, length(?1)) = ?1",
      params![prefix],
    )?;
    Ok(removed)
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ttl_cache", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}
