//! Pollable live query handle for event-loop consumers.
//!
//! # Example
//!
//! ```ignore
//! let mut assignments = sync.live::<Assignment>(
//!   QuerySpec::collection("assignments").where_eq("classId", class_id),
//!   WatchOptions::live(),
//! );
//!
//! // In event loop tick
//! if assignments.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match assignments.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::watch::{Subscription, Update};
use crate::cache::CacheSource;
use crate::error::SyncError;

/// The state of a live query
#[derive(Debug)]
pub enum QueryState<T> {
  /// No snapshot has arrived yet
  Loading,
  /// Latest snapshot
  Success(Arc<Vec<T>>),
  /// The subscription reported an error
  Error(SyncError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&[T]> {
    match self {
      QueryState::Success(data) => Some(data.as_slice()),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Live query with state management.
///
/// LiveQuery<T> encapsulates:
/// - The underlying change-detecting subscription
/// - Loading/success/error states
/// - Non-blocking result handling via a single-slot channel
pub struct LiveQuery<T> {
  state: QueryState<T>,
  receiver: watch::Receiver<Option<Update<T>>>,
  subscription: Subscription,
  source: Option<CacheSource>,
  updated_at: Option<Instant>,
  closed: bool,
}

impl<T> LiveQuery<T> {
  pub(crate) fn new(subscription: Subscription, receiver: watch::Receiver<Option<Update<T>>>) -> Self {
    Self {
      state: QueryState::Loading,
      receiver,
      subscription,
      source: None,
      updated_at: None,
      closed: false,
    }
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the records if the last snapshot succeeded.
  pub fn data(&self) -> Option<&[T]> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.state.error()
  }

  /// Where the current data came from, once any has arrived.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  /// Time since the last state change.
  pub fn age(&self) -> Option<Duration> {
    self.updated_at.map(|t| t.elapsed())
  }

  /// Poll for a newer snapshot.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => self.take_latest(),
      Ok(false) => false,
      // The final value may not have been seen yet
      Err(_) if !self.closed => {
        self.closed = true;
        self.take_latest()
      }
      Err(_) => false,
    }
  }

  /// Wait for the next state change. Returns `false` once the subscription
  /// has ended and every update has been seen.
  pub async fn next_update(&mut self) -> bool {
    if self.poll() {
      return true;
    }

    loop {
      match self.receiver.changed().await {
        Ok(()) => {
          if self.take_latest() {
            return true;
          }
        }
        Err(_) => return false,
      }
    }
  }

  /// Stop the underlying subscription. The last state is kept.
  pub fn stop(&self) {
    self.subscription.stop();
  }

  pub fn is_active(&self) -> bool {
    self.subscription.is_active()
  }

  fn take_latest(&mut self) -> bool {
    let latest = self.receiver.borrow_and_update().clone();
    match latest {
      Some(update) => self.apply(update),
      None => false,
    }
  }

  fn apply(&mut self, update: Update<T>) -> bool {
    if let QueryState::Success(current) = &self.state {
      if update.error.is_none() && Arc::ptr_eq(current, &update.records) {
        return false;
      }
    }

    self.source = Some(update.source);
    self.updated_at = Some(Instant::now());
    self.state = match update.error {
      Some(e) => QueryState::Error(e),
      None => QueryState::Success(update.records),
    };
    true
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LiveQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LiveQuery")
      .field("state", &self.state)
      .field("source", &self.source)
      .field("subscription", &self.subscription)
      .finish_non_exhaustive()
  }
}
