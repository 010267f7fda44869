//! Serialized form of a cached value and its freshness metadata.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single cached value with the metadata needed for freshness and LRU
/// decisions.
///
/// Entries are stored as JSON blobs. A blob that fails to decode is treated
/// by readers as a cache miss, never as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  /// The cached value.
  pub payload: Value,
  /// When the value was written.
  pub created_at: DateTime<Utc>,
  /// When the value was last read. Bumped on every hit.
  pub last_access_at: DateTime<Utc>,
  /// Entry-specific time-to-live in milliseconds.
  pub ttl_ms: i64,
  /// Cache format tag. A mismatch against the reader's expected version is a
  /// miss regardless of age.
  pub schema_version: String,
}

impl CacheEntry {
  /// Create a fresh entry written at `now`.
  pub fn new(payload: Value, ttl_ms: i64, schema_version: &str, now: DateTime<Utc>) -> Self {
    Self {
      payload,
      created_at: now,
      last_access_at: now,
      ttl_ms,
      schema_version: schema_version.to_string(),
    }
  }

  /// An entry is fresh iff it is younger than `limit_ms` and carries the
  /// expected schema version.
  pub fn is_fresh(&self, now: DateTime<Utc>, expected_schema: &str, limit_ms: i64) -> bool {
    self.schema_version == expected_schema
      && now - self.created_at < Duration::milliseconds(limit_ms)
  }

  /// Age of the entry in milliseconds at `now`.
  pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
    (now - self.created_at).num_milliseconds()
  }

  pub fn encode(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(self).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    serde_json::from_slice(bytes).map_err(|e| eyre!("Failed to parse cache entry: {}", e))
  }
}
