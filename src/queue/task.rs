//! Sync task records and the retry/backoff policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a queued task does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
  /// Re-fetch a resource from the backend.
  Refresh,
  /// Apply a pending mutation to the backend.
  Mutate,
  /// Announce an invalidation without touching the backend.
  InvalidateNotify,
}

/// Drain order: all High tasks before any Normal, all Normal before any Low.
/// Declaration order drives the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  High,
  Normal,
  Low,
}

/// Lifecycle of a task: Pending -> Executing -> Completed, or on failure
/// PendingRetry (back to Executing) until attempts run out, then Failed.
/// Pending and PendingRetry tasks are the ones persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  Executing,
  Completed,
  PendingRetry,
  Failed,
}

/// A persisted unit of pending work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
  pub id: String,
  pub kind: TaskKind,
  pub priority: Priority,
  pub payload: Value,
  /// Reason published on the invalidation bus when the task succeeds.
  pub invalidation_reason: Option<String>,
  /// Failed attempts so far.
  pub attempt: u32,
  pub max_attempts: u32,
  pub enqueued_at: DateTime<Utc>,
  pub next_attempt_at: DateTime<Utc>,
}

impl SyncTask {
  /// Whether the task may be executed at `now`.
  pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at <= now
  }

  /// State a persisted record is in. Executing, Completed, and Failed are
  /// transient and never observed through the store.
  pub fn state(&self) -> TaskState {
    if self.attempt == 0 {
      TaskState::Pending
    } else {
      TaskState::PendingRetry
    }
  }

  /// Sort key for drain order: priority first, then eligibility time, then
  /// enqueue time and id for a stable total order.
  pub fn drain_order(&self) -> (Priority, DateTime<Utc>, DateTime<Utc>, String) {
    (
      self.priority,
      self.next_attempt_at,
      self.enqueued_at,
      self.id.clone(),
    )
  }
}

/// Capped exponential backoff: `min(2^attempt * base_ms, cap_ms)`.
pub fn backoff_ms(attempt: u32, base_ms: i64, cap_ms: i64) -> i64 {
  let shift = attempt.min(30);
  let delay = base_ms.saturating_mul(1i64 << shift);
  delay.min(cap_ms)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn backoff_doubles_and_caps() {
    assert_eq!(backoff_ms(1, 1000, 30_000), 2000);
    assert_eq!(backoff_ms(2, 1000, 30_000), 4000);
    assert_eq!(backoff_ms(3, 1000, 30_000), 8000);
    assert_eq!(backoff_ms(10, 1000, 30_000), 30_000);
    // Huge attempt counts must not overflow
    assert_eq!(backoff_ms(1000, 1000, 30_000), 30_000);
  }

  #[test]
  fn priority_orders_high_first() {
    assert!(Priority::High < Priority::Normal);
    assert!(Priority::Normal < Priority::Low);
  }

  #[test]
  fn task_round_trips_through_json() {
    let now = Utc::now();
    let task = SyncTask {
      id: "task-1".to_string(),
      kind: TaskKind::Mutate,
      priority: Priority::High,
      payload: json!({"resource": "user/u1", "body": {"name": "Ada"}}),
      invalidation_reason: Some("user_data_change".to_string()),
      attempt: 1,
      max_attempts: 3,
      enqueued_at: now,
      next_attempt_at: now,
    };

    let bytes = serde_json::to_vec(&task).unwrap();
    let decoded: SyncTask = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded.id, task.id);
    assert_eq!(decoded.kind, TaskKind::Mutate);
    assert_eq!(decoded.priority, Priority::High);
    assert_eq!(decoded.attempt, 1);
  }

  #[test]
  fn eligibility_follows_next_attempt_at() {
    let now = Utc::now();
    let task = SyncTask {
      id: "task-1".to_string(),
      kind: TaskKind::Refresh,
      priority: Priority::Normal,
      payload: json!({}),
      invalidation_reason: None,
      attempt: 0,
      max_attempts: 3,
      enqueued_at: now,
      next_attempt_at: now + chrono::Duration::milliseconds(500),
    };

    assert!(!task.is_eligible(now));
    assert!(task.is_eligible(now + chrono::Duration::milliseconds(500)));
    assert_eq!(task.state(), TaskState::Pending);

    let retried = SyncTask { attempt: 1, ..task };
    assert_eq!(retried.state(), TaskState::PendingRetry);
  }
}
