//! TTL caching for query results.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Stores serialized results under a derived key with a per-entry TTL
//! - Evicts entries lazily once `now - stored_at > ttl`
//! - Invalidates single keys, whole collections, or everything
//! - Serves cache-first reads with retried network fetches on a miss

mod layer;
mod storage;
mod traits;
mod ttl;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, QueryKey};
pub use ttl::TtlCache;
