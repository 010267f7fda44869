//! Concurrent fetch deduplication.
//!
//! The first caller for a logical key becomes the leader and runs the real
//! operation; every concurrent caller for the same key attaches as a waiter
//! and receives the leader's result. At most one underlying operation is in
//! flight per key at any time.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::ApiError;

/// Book-keeping for one in-flight operation.
struct InFlight<T> {
  tx: broadcast::Sender<Result<T, ApiError>>,
  waiter_count: usize,
}

/// Deduplicates concurrent fetches for the same key.
///
/// Once started, an operation runs to completion on its own task: a caller
/// that stops waiting does not abort it, and its result still lands wherever
/// the operation writes it (typically the cache).
pub struct RequestCoordinator<T> {
  in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
}

impl<T> RequestCoordinator<T>
where
  T: Clone + Send + 'static,
{
  pub fn new() -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Run `op` for `key`, or wait on the one already running.
  ///
  /// Failures fan out to every attached waiter and are not cached: the next
  /// call after settlement starts a fresh operation.
  pub async fn coordinate<F, Fut>(&self, key: &str, op: F) -> Result<T, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    // Check-then-register is one critical section: two callers can never
    // both become the leader for the same key.
    let (mut rx, is_leader) = {
      let mut in_flight = self
        .in_flight
        .lock()
        .map_err(|_| ApiError::permanent("in-flight table lock poisoned"))?;

      match in_flight.get_mut(key) {
        Some(entry) => {
          entry.waiter_count += 1;
          (entry.tx.subscribe(), false)
        }
        None => {
          let (tx, rx) = broadcast::channel(1);
          in_flight.insert(
            key.to_string(),
            InFlight {
              tx,
              waiter_count: 0,
            },
          );
          (rx, true)
        }
      }
    };

    if is_leader {
      let in_flight = Arc::clone(&self.in_flight);
      let key = key.to_string();
      let fut = op();

      tokio::spawn(async move {
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
          Ok(result) => result,
          Err(_) => Err(ApiError::permanent(format!(
            "coordinated operation for {} panicked",
            key
          ))),
        };

        // Remove the entry before fanning out, so a caller arriving after
        // settlement starts fresh instead of observing this result.
        let entry = match in_flight.lock() {
          Ok(mut map) => map.remove(&key),
          Err(_) => None,
        };

        if let Some(entry) = entry {
          if entry.waiter_count > 0 {
            debug!(
              "fanning out result for {} to {} waiters",
              key, entry.waiter_count
            );
          }
          // Ignore send errors - all waiters may have been dropped
          let _ = entry.tx.send(result);
        }
      });
    } else {
      debug!("joining in-flight request for {}", key);
    }

    match rx.recv().await {
      Ok(result) => result,
      Err(_) => Err(ApiError::retryable(format!(
        "in-flight request for {} was dropped before settling",
        key
      ))),
    }
  }

  /// Number of operations currently in flight.
  pub fn in_flight_count(&self) -> usize {
    self.in_flight.lock().map(|map| map.len()).unwrap_or(0)
  }
}

impl<T> Default for RequestCoordinator<T>
where
  T: Clone + Send + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}
