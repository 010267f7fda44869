//! Tunables for the cache and sync layer.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cache::DEFAULT_MAX_ENTRIES;

/// Configuration surface of the sync core.
///
/// Everything has a sensible default; a YAML file can override any subset:
///
/// ```yaml
/// max_entries: 100
/// max_attempts: 5
/// ttl:
///   insights_ms: 21600000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Bound on cached entry count before LRU eviction runs.
  pub max_entries: usize,
  /// Cache format tag; bump it to invalidate every persisted entry at once.
  pub schema_version: String,
  /// Executions per sync task before it is dropped with a terminal event.
  pub max_attempts: u32,
  /// Base delay for exponential retry backoff.
  pub backoff_base_ms: i64,
  /// Upper bound on a single backoff delay.
  pub backoff_cap_ms: i64,
  pub ttl: TtlConfig,
}

/// Per-resource default TTLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
  pub user_ms: i64,
  pub dashboard_ms: i64,
  /// Insights are expensive to regenerate, but a whole day is too stale.
  pub insights_ms: i64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_entries: DEFAULT_MAX_ENTRIES,
      schema_version: "v1".to_string(),
      max_attempts: 3,
      backoff_base_ms: 1000,
      backoff_cap_ms: 30_000,
      ttl: TtlConfig::default(),
    }
  }
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      user_ms: 24 * 60 * 60 * 1000,
      dashboard_ms: 24 * 60 * 60 * 1000,
      insights_ms: 6 * 60 * 60 * 1000,
    }
  }
}

impl SyncConfig {
  /// Load configuration from a YAML file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: SyncConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let config = SyncConfig::default();
    assert_eq!(config.max_entries, 50);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.backoff_base_ms, 1000);
    assert_eq!(config.ttl.user_ms, 86_400_000);
    assert_eq!(config.ttl.insights_ms, 21_600_000);
  }

  #[test]
  fn partial_yaml_overrides_only_what_it_names() {
    let config: SyncConfig =
      serde_yaml::from_str("max_entries: 10\nttl:\n  insights_ms: 300000\n").unwrap();

    assert_eq!(config.max_entries, 10);
    assert_eq!(config.ttl.insights_ms, 300_000);
    // Untouched fields keep their defaults
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.ttl.user_ms, 86_400_000);
  }
}
