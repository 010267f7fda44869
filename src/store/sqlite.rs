//! SQLite-backed key/value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyValueStore;

/// Schema for the key/value table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable store backed by a single SQLite table.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open a transient in-memory store. Used in tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("nestsync").join("sync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

/// Escape LIKE wildcards so a prefix matches literally.
fn like_prefix(prefix: &str) -> String {
  let mut escaped = String::with_capacity(prefix.len() + 1);
  for c in prefix.chars() {
    if c == '\\' || c == '%' || c == '_' {
      escaped.push('\\');
    }
    escaped.push(c);
  }
  escaped.push('%');
  escaped
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let value: Option<Vec<u8>> = stmt.query_row(params![key], |row| row.get(0)).ok();

    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store value: {}", e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete value: {}", e))?;

    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv WHERE key LIKE ? ESCAPE '\\' ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys: Vec<String> = stmt
      .query_map(params![like_prefix(prefix)], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn total_bytes(&self, prefix: &str) -> Result<u64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT COALESCE(SUM(LENGTH(value)), 0) FROM kv WHERE key LIKE ? ESCAPE '\\'")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let total: i64 = stmt
      .query_row(params![like_prefix(prefix)], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query byte total: {}", e))?;

    Ok(total as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sqlite_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("cache:a", b"hello").unwrap();
    assert_eq!(store.get("cache:a").unwrap(), Some(b"hello".to_vec()));

    store.set("cache:a", b"replaced").unwrap();
    assert_eq!(store.get("cache:a").unwrap(), Some(b"replaced".to_vec()));

    store.delete("cache:a").unwrap();
    assert_eq!(store.get("cache:a").unwrap(), None);
  }

  #[test]
  fn sqlite_prefix_scan() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("cache:b", b"2").unwrap();
    store.set("cache:a", b"1").unwrap();
    store.set("task:1", b"t").unwrap();

    let keys = store.keys_with_prefix("cache:").unwrap();
    assert_eq!(keys, vec!["cache:a".to_string(), "cache:b".to_string()]);
    assert_eq!(store.keys_with_prefix("task:").unwrap().len(), 1);
    assert!(store.keys_with_prefix("missing:").unwrap().is_empty());
  }

  #[test]
  fn sqlite_like_wildcards_are_literal() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("a%b:1", b"x").unwrap();
    store.set("axb:2", b"y").unwrap();

    // "%" in the prefix must not act as a wildcard
    let keys = store.keys_with_prefix("a%b:").unwrap();
    assert_eq!(keys, vec!["a%b:1".to_string()]);
  }

  #[test]
  fn sqlite_byte_accounting() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.total_bytes("cache:").unwrap(), 0);

    store.set("cache:a", b"12345").unwrap();
    store.set("cache:b", b"123").unwrap();
    assert_eq!(store.total_bytes("cache:").unwrap(), 8);
  }

  #[test]
  fn sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.set("task:1", b"pending").unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(store.get("task:1").unwrap(), Some(b"pending".to_vec()));
  }
}
