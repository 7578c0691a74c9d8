//! Retry with exponential backoff for one-shot reads.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time;

use crate::error::SyncError;

/// How often and how patiently a failed read is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total number of attempts, including the first one.
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles for each attempt after that.
  #[serde(deserialize_with = "millis::deserialize", rename = "base_delay_ms")]
  pub base_delay: Duration,
  /// Upper bound for a single delay.
  #[serde(deserialize_with = "millis::deserialize", rename = "max_delay_ms")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
    Self {
      max_attempts,
      base_delay,
      ..Self::default()
    }
  }

  /// Policy that runs the operation once.
  pub fn none() -> Self {
    Self::new(1, Duration::ZERO)
  }

  /// Delay after the zero-based `attempt` failed: `base * 2^attempt`, capped.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// Run `op` until it succeeds, fails with a permission error, or runs out of
/// attempts. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, SyncError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, SyncError>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 0u32;

  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_permission() => {
        tracing::debug!("Not retrying permission error: {}", e);
        return Err(e);
      }
      Err(e) if attempt + 1 >= max_attempts => {
        tracing::warn!("Giving up after {} attempts: {}", max_attempts, e);
        return Err(e);
      }
      Err(e) => {
        let delay = policy.delay_for(attempt);
        tracing::warn!(
          "Attempt {}/{} failed: {}. Retrying in {:?}...",
          attempt + 1,
          max_attempts,
          e,
          delay
        );
        time::sleep(delay).await;
        attempt += 1;
      }
    }
  }
}

pub(crate) mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_permission_error_is_attempted_once() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<(), _> = retry_with_backoff(&RetryPolicy::new(5, Duration::from_millis(100)), || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(SyncError::PermissionDenied("missing role".into())) }
    })
    .await;

    assert_eq!(result, Err(SyncError::PermissionDenied("missing role".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_on_third_attempt_after_backoff() {
    let base = Duration::from_millis(200);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let started = time::Instant::now();

    let result = retry_with_backoff(&RetryPolicy::new(3, base), || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(SyncError::Unavailable("connection reset".into()))
        } else {
          Ok("roster")
        }
      }
    })
    .await;

    assert_eq!(result, Ok("roster"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= base + base * 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_attempts_return_last_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<(), _> = retry_with_backoff(&RetryPolicy::new(4, Duration::from_millis(10)), || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move { Err(SyncError::Unavailable(format!("attempt {}", n))) }
    })
    .await;

    assert_eq!(result, Err(SyncError::Unavailable("attempt 3".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn test_delay_is_capped() {
    let policy = RetryPolicy {
      max_attempts: 10,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(5),
    };
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(5));
    assert_eq!(policy.delay_for(40), Duration::from_secs(5));
  }

  #[test]
  fn test_zero_attempts_runs_once() {
    let rt = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap();
    let attempts = AtomicU32::new(0);
    let result: Result<(), _> = rt.block_on(retry_with_backoff(&RetryPolicy::new(0, Duration::ZERO), || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(SyncError::Backend("boom".into())) }
    }));
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }
}
