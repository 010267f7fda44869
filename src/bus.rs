//! Invalidation broadcast between cache consumers.
//!
//! A thin publish/subscribe channel for "data domain X changed" announcements.
//! Delivery is synchronous and best-effort, in subscription order; there is no
//! persistence, so only subscribers active at publish time hear an event. A
//! component that missed one re-checks freshness on its next cache read.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Reason tags are free-form. These are the ones the core itself publishes.
pub mod reasons {
  pub const USER_DATA_CHANGE: &str = "user_data_change";
  pub const DASHBOARD_DATA_CHANGE: &str = "dashboard_data_change";
  pub const INSIGHTS_CHANGE: &str = "insights_change";
  pub const MANUAL_REFRESH: &str = "manual_refresh";
  pub const SYNC_TASK_FAILED: &str = "sync_task_failed";
}

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

struct Subscriber {
  id: u64,
  callback: Callback,
}

#[derive(Default)]
struct BusInner {
  next_id: u64,
  subscribers: Vec<Subscriber>,
}

/// Publish/subscribe channel for invalidation reasons.
#[derive(Clone, Default)]
pub struct InvalidationBus {
  inner: Arc<Mutex<BusInner>>,
}

impl InvalidationBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a callback. The returned handle unsubscribes explicitly or on
  /// drop, so a forgotten handle cannot leak a listener forever.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    let id = {
      let mut inner = match self.inner.lock() {
        Ok(inner) => inner,
        Err(e) => e.into_inner(),
      };
      inner.next_id += 1;
      let id = inner.next_id;
      inner.subscribers.push(Subscriber {
        id,
        callback: Arc::new(callback),
      });
      id
    };

    Subscription {
      id,
      inner: Arc::clone(&self.inner),
    }
  }

  /// Deliver a reason to every current subscriber, in subscription order.
  ///
  /// A panicking subscriber is caught and logged; it never blocks the rest.
  pub fn publish(&self, reason: &str) {
    // Snapshot outside the lock so a subscriber may publish or subscribe
    // reentrantly without deadlocking.
    let callbacks: Vec<Callback> = {
      let inner = match self.inner.lock() {
        Ok(inner) => inner,
        Err(e) => e.into_inner(),
      };
      inner.subscribers.iter().map(|s| Arc::clone(&s.callback)).collect()
    };

    debug!("publishing {} to {} subscribers", reason, callbacks.len());

    for callback in callbacks {
      if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
        warn!("subscriber panicked while handling {}", reason);
      }
    }
  }

  pub fn subscriber_count(&self) -> usize {
    match self.inner.lock() {
      Ok(inner) => inner.subscribers.len(),
      Err(e) => e.into_inner().subscribers.len(),
    }
  }
}

/// Handle for one subscription. Dropping it unsubscribes.
pub struct Subscription {
  id: u64,
  inner: Arc<Mutex<BusInner>>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }

  fn remove(&self) {
    let mut inner = match self.inner.lock() {
      Ok(inner) => inner,
      Err(e) => e.into_inner(),
    };
    inner.subscribers.retain(|s| s.id != self.id);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.remove();
  }
}
