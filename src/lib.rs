//! Real-time data sync layer for a school LMS.
//!
//! - [`sync`]: change-detecting live query subscriptions and cached reads
//! - [`cache`]: TTL cache storage and the cache-first fetch layer
//! - [`retry`]: exponential backoff for one-shot reads
//! - [`backend`]: document store seam, in-memory and Firestore REST
//! - [`lms`]: typed LMS records and the client built on the above

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod lms;
pub mod query;
pub mod retry;
pub mod sync;

pub use error::{ErrorKind, Result, SyncError};
pub use query::QuerySpec;
pub use sync::{LiveQuery, Subscription, SyncManager, Update, WatchOptions};
