//! Persistent key/value storage.
//!
//! The cache and the sync queue both persist through this interface, under
//! disjoint key prefixes, so a page-reload-equivalent restart resumes with
//! warm caches and pending work intact.

mod sqlite;

pub use sqlite::SqliteStore;

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Durable key/value store with prefix enumeration and byte accounting.
pub trait KeyValueStore: Send + Sync {
  /// Get the value for a key, or None if absent.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Set a key, replacing any existing value.
  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Delete a key. Deleting an absent key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// All keys starting with the given prefix, sorted ascending.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

  /// Total stored value bytes under the given prefix.
  fn total_bytes(&self, prefix: &str) -> Result<u64>;
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// In-memory store used in tests and when persistence is disabled.
///
/// Backed by a BTreeMap so prefix scans come back in key order, matching the
/// SQLite implementation.
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
    }
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }

  fn total_bytes(&self, prefix: &str) -> Result<u64> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v.len() as u64)
        .sum(),
    )
  }
}
