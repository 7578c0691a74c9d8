//! Error type shared by the backend, cache and sync layers.

use thiserror::Error;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  PermissionDenied,
  Unavailable,
  NotFound,
  Validation,
  Decode,
  Storage,
  Export,
  Backend,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Caller lacks authorization. Never retried.
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  /// Network failure, timeout, rate limit or server error.
  #[error("backend unavailable: {0}")]
  Unavailable(String),

  #[error("not found: {0}")]
  NotFound(String),

  /// Client-side check rejected the operation before anything was written.
  #[error("invalid input: {0}")]
  Validation(String),

  #[error("failed to decode record: {0}")]
  Decode(String),

  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("export failed: {0}")]
  Export(String),

  #[error("backend error: {0}")]
  Backend(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
      SyncError::Unavailable(_) => ErrorKind::Unavailable,
      SyncError::NotFound(_) => ErrorKind::NotFound,
      SyncError::Validation(_) => ErrorKind::Validation,
      SyncError::Decode(_) => ErrorKind::Decode,
      SyncError::Storage(_) => ErrorKind::Storage,
      SyncError::Export(_) => ErrorKind::Export,
      SyncError::Backend(_) => ErrorKind::Backend,
    }
  }

  pub fn is_permission(&self) -> bool {
    self.kind() == ErrorKind::PermissionDenied
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    SyncError::Validation(msg.into())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

impl From<csv::Error> for SyncError {
  fn from(e: csv::Error) -> Self {
    SyncError::Export(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_permission_classification() {
    assert!(SyncError::PermissionDenied("rules".into()).is_permission());
    assert!(!SyncError::Unavailable("timeout".into()).is_permission());
    assert_eq!(SyncError::validation("empty title").kind(), ErrorKind::Validation);
  }
}
