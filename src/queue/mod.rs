//! Persisted queue of pending mutations and refreshes.
//!
//! Tasks are stored under their own key prefix so a restart resumes pending
//! work. The drain loop runs one task at a time, honors priority and retry
//! eligibility, gates on connectivity, and publishes invalidation events for
//! completed work.

mod task;

pub use task::{backoff_ms, Priority, SyncTask, TaskKind, TaskState};

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::{ApiError, ConnectivitySignal};
use crate::bus::{reasons, InvalidationBus};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::store::SharedStore;

/// Store prefix owned exclusively by the queue.
pub const TASK_PREFIX: &str = "task:";

/// Executes one attempt of a task against the backend. Errors carry a
/// retryable flag that drives the backoff policy.
pub type TaskExecutor = Box<dyn Fn(SyncTask) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// Ordered, priority-aware queue of pending sync work.
///
/// At most one task executes at a time per queue instance. Callers wanting
/// parallelism across independent resources run multiple queues.
pub struct SyncQueue {
  store: SharedStore,
  clock: SharedClock,
  bus: InvalidationBus,
  executor: TaskExecutor,
  max_attempts: u32,
  backoff_base_ms: i64,
  backoff_cap_ms: i64,
  online: AtomicBool,
  drain_lock: tokio::sync::Mutex<()>,
  /// Set when a drain call loses the lock race, so the running drain
  /// re-scans before exiting instead of stranding a just-enqueued task.
  drain_requested: AtomicBool,
  seq: AtomicU64,
}

impl SyncQueue {
  pub fn new(
    store: SharedStore,
    clock: SharedClock,
    bus: InvalidationBus,
    config: &SyncConfig,
    executor: TaskExecutor,
  ) -> Self {
    Self {
      store,
      clock,
      bus,
      executor,
      max_attempts: config.max_attempts,
      backoff_base_ms: config.backoff_base_ms,
      backoff_cap_ms: config.backoff_cap_ms,
      online: AtomicBool::new(true),
      drain_lock: tokio::sync::Mutex::new(()),
      drain_requested: AtomicBool::new(false),
      seq: AtomicU64::new(0),
    }
  }

  /// Persist a new task and immediately attempt a drain.
  ///
  /// Unlike cache writes, a persistence failure here is a hard error: a
  /// silently dropped mutation would be lost work.
  pub async fn enqueue(
    &self,
    kind: TaskKind,
    priority: Priority,
    payload: Value,
    invalidation_reason: Option<String>,
  ) -> Result<String> {
    let now = self.clock.now();
    let seq = self.seq.fetch_add(1, Ordering::SeqCst);
    let id = format!("task-{:013}-{:06}", now.timestamp_millis(), seq);

    let task = SyncTask {
      id: id.clone(),
      kind,
      priority,
      payload,
      invalidation_reason,
      attempt: 0,
      max_attempts: self.max_attempts,
      enqueued_at: now,
      next_attempt_at: now,
    };

    self.persist(&task)?;
    debug!("enqueued task {} ({:?}, {:?})", id, kind, priority);

    self.drain().await;
    Ok(id)
  }

  /// Flip the connectivity state. Going online resumes draining immediately;
  /// going offline stops new executions but keeps every pending task.
  pub async fn set_online(&self, online: bool) {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if online && !was_online {
      debug!("connectivity restored, resuming drain");
      self.drain().await;
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Bind the queue to a connectivity signal: transitions drive
  /// `set_online` on a background task.
  pub fn watch_connectivity(self: Arc<Self>, signal: &ConnectivitySignal) {
    let mut rx = signal.subscribe();
    let queue = self;

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow();
        queue.set_online(online).await;
      }
    });
  }

  /// Spawn a background task that re-drains on a fixed cadence, picking up
  /// tasks whose backoff has elapsed. Abort the handle at shutdown.
  pub fn spawn_periodic_drain(
    self: Arc<Self>,
    interval: std::time::Duration,
  ) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        self.drain().await;
      }
    })
  }

  /// Execute eligible tasks until none remain or connectivity drops.
  ///
  /// Serialized: if a drain is already running, this returns immediately
  /// after flagging it. The running drain re-checks the flag before exiting,
  /// so a task persisted during its final scan is still picked up. Tasks
  /// waiting on backoff stay persisted; a later drain (triggered
  /// periodically by the caller or by the next enqueue) retries them.
  pub async fn drain(&self) {
    self.drain_requested.store(true, Ordering::SeqCst);

    while self.drain_requested.swap(false, Ordering::SeqCst) {
      let _guard = match self.drain_lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
          // The holder re-checks the flag after its pass
          self.drain_requested.store(true, Ordering::SeqCst);
          return;
        }
      };

      loop {
        if !self.is_online() {
          debug!("offline, drain halted");
          break;
        }

        let now = self.clock.now();
        let next = self
          .pending_tasks()
          .into_iter()
          .filter(|t| t.is_eligible(now))
          .min_by_key(|t| t.drain_order());

        match next {
          Some(task) => self.execute(task).await,
          None => break,
        }
      }
    }
  }

  async fn execute(&self, mut task: SyncTask) {
    debug!(
      "executing task {} (attempt {}/{})",
      task.id,
      task.attempt + 1,
      task.max_attempts
    );

    // Pure notification tasks never touch the backend
    let result = if task.kind == TaskKind::InvalidateNotify {
      Ok(())
    } else {
      (self.executor)(task.clone()).await
    };

    match result {
      Ok(()) => {
        self.remove(&task.id);
        if let Some(reason) = &task.invalidation_reason {
          self.bus.publish(reason);
        }
      }
      Err(e) => {
        task.attempt += 1;

        if e.retryable && task.attempt < task.max_attempts {
          let backoff = backoff_ms(task.attempt, self.backoff_base_ms, self.backoff_cap_ms);
          task.next_attempt_at = self.clock.now() + Duration::milliseconds(backoff);
          warn!(
            "task {} failed (attempt {}/{}), retrying in {}ms: {}",
            task.id, task.attempt, task.max_attempts, backoff, e
          );

          if let Err(persist_err) = self.persist(&task) {
            warn!("failed to persist retry state for {}: {}", task.id, persist_err);
          }
        } else {
          warn!(
            "task {} dropped after {} attempt(s): {}",
            task.id, task.attempt, e
          );
          self.remove(&task.id);
          self.bus.publish(reasons::SYNC_TASK_FAILED);
        }
      }
    }
  }

  /// All persisted tasks, in drain order. Corrupt records are dropped.
  pub fn pending_tasks(&self) -> Vec<SyncTask> {
    let keys = match self.store.keys_with_prefix(TASK_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!("failed to scan pending tasks: {}", e);
        return Vec::new();
      }
    };

    let mut tasks = Vec::new();
    for key in keys {
      match self.store.get(&key) {
        Ok(Some(bytes)) => match serde_json::from_slice::<SyncTask>(&bytes) {
          Ok(task) => tasks.push(task),
          Err(e) => {
            warn!("dropping corrupt task record {}: {}", key, e);
            let _ = self.store.delete(&key);
          }
        },
        Ok(None) => {}
        Err(e) => warn!("failed to read task record {}: {}", key, e),
      }
    }

    tasks.sort_by_key(|t| t.drain_order());
    tasks
  }

  fn store_key(id: &str) -> String {
    format!("{}{}", TASK_PREFIX, id)
  }

  fn persist(&self, task: &SyncTask) -> Result<()> {
    let bytes =
      serde_json::to_vec(task).map_err(|e| eyre!("Failed to serialize task: {}", e))?;
    self.store.set(&Self::store_key(&task.id), &bytes)
  }

  fn remove(&self, id: &str) {
    if let Err(e) = self.store.delete(&Self::store_key(id)) {
      warn!("failed to remove task {}: {}", id, e);
    }
  }
}
