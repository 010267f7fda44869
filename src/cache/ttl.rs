//! Freshness-checked cache over the persistent store, with LRU eviction.
//!
//! Every operation here is fail-open: a storage error degrades to a miss or a
//! skipped write and is logged, never surfaced to the caller. Correctness of
//! the layers above must not depend on the cache.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use crate::clock::SharedClock;
use crate::store::SharedStore;

/// Store prefix owned exclusively by the cache. No other component writes
/// keys under it.
pub const CACHE_PREFIX: &str = "cache:";

/// Default bound on the number of cached entries.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// Snapshot of cache occupancy, used to decide when eviction runs.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
  pub entries: usize,
  pub total_bytes: u64,
  pub max_entries: usize,
}

/// TTL cache with LRU eviction.
///
/// TTL is a property of each write; if two callers write the same key with
/// different TTLs, the last writer's TTL wins. Callers that need distinct
/// freshness semantics for the same data must encode that intent into the
/// logical key.
#[derive(Clone)]
pub struct TtlCache {
  store: SharedStore,
  clock: SharedClock,
  max_entries: usize,
  schema_version: String,
  /// Serializes compound store sequences (count, evict, insert) across
  /// clones, so the entry bound holds under parallel writes.
  op_lock: Arc<Mutex<()>>,
}

impl TtlCache {
  pub fn new(
    store: SharedStore,
    clock: SharedClock,
    max_entries: usize,
    schema_version: &str,
  ) -> Self {
    Self {
      store,
      clock,
      max_entries,
      schema_version: schema_version.to_string(),
      op_lock: Arc::new(Mutex::new(())),
    }
  }

  fn store_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    match self.op_lock.lock() {
      Ok(guard) => guard,
      Err(e) => e.into_inner(),
    }
  }

  /// Read a cached value.
  ///
  /// Returns None on absence, expiry, schema mismatch, a corrupt entry, or a
  /// store failure. `max_age_ms` lets a caller demand stricter freshness than
  /// the entry's own TTL; it can only tighten, never extend.
  ///
  /// A hit bumps the entry's last-access time so LRU eviction keeps hot
  /// entries alive.
  pub fn read(&self, key: &str, max_age_ms: Option<i64>) -> Option<Value> {
    let _guard = self.guard();
    let store_key = Self::store_key(key);

    let bytes = match self.store.get(&store_key) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => {
        debug!("cache miss for {}", key);
        return None;
      }
      Err(e) => {
        warn!("cache read for {} failed, treating as miss: {}", key, e);
        return None;
      }
    };

    let mut entry = match CacheEntry::decode(&bytes) {
      Ok(entry) => entry,
      Err(e) => {
        warn!("corrupt cache entry for {}, treating as miss: {}", key, e);
        return None;
      }
    };

    let now = self.clock.now();
    let limit_ms = match max_age_ms {
      Some(max_age) => max_age.min(entry.ttl_ms),
      None => entry.ttl_ms,
    };

    if !entry.is_fresh(now, &self.schema_version, limit_ms) {
      debug!(
        "cache entry for {} is stale (age {}ms) or schema-mismatched",
        key,
        entry.age_ms(now)
      );
      return None;
    }

    // Write-back the access bump; losing it only weakens LRU ordering.
    entry.last_access_at = now;
    if let Ok(bytes) = entry.encode() {
      if let Err(e) = self.store.set(&store_key, &bytes) {
        warn!("failed to bump last access for {}: {}", key, e);
      }
    }

    Some(entry.payload)
  }

  /// Write a value with the given TTL.
  ///
  /// Runs eviction first when the cache is at capacity and the key is new.
  /// A store failure triggers one eviction pass and one retry; if that also
  /// fails the write is abandoned and `false` is returned.
  pub fn write(&self, key: &str, payload: Value, ttl_ms: i64) -> bool {
    let _guard = self.guard();
    let store_key = Self::store_key(key);
    let now = self.clock.now();

    let is_new = !matches!(self.store.get(&store_key), Ok(Some(_)));
    if is_new && self.entry_count() >= self.max_entries {
      self.evict_until(self.max_entries.saturating_sub(1));
    }

    let entry = CacheEntry::new(payload, ttl_ms, &self.schema_version, now);
    let bytes = match entry.encode() {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!("failed to serialize cache entry for {}: {}", key, e);
        return false;
      }
    };

    match self.store.set(&store_key, &bytes) {
      Ok(()) => true,
      Err(e) => {
        warn!("cache write for {} failed, evicting and retrying: {}", key, e);
        self.evict_until(self.max_entries.saturating_sub(1));

        match self.store.set(&store_key, &bytes) {
          Ok(()) => true,
          Err(e) => {
            warn!("cache write for {} abandoned after retry: {}", key, e);
            false
          }
        }
      }
    }
  }

  /// Evict least-recently-used entries until the cache is within its bound.
  /// Returns the number of entries removed.
  pub fn evict_to_capacity(&self) -> usize {
    let _guard = self.guard();
    self.evict_until(self.max_entries)
  }

  fn evict_until(&self, target: usize) -> usize {
    let keys = match self.store.keys_with_prefix(CACHE_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!("eviction scan failed: {}", e);
        return 0;
      }
    };

    if keys.len() <= target {
      return 0;
    }

    // Rank by (last_access_at, key); unreadable entries sort first so they
    // are reclaimed before anything usable.
    let mut ranked: Vec<(DateTime<Utc>, String)> = keys
      .into_iter()
      .map(|key| {
        let last_access = self
          .store
          .get(&key)
          .ok()
          .flatten()
          .and_then(|bytes| CacheEntry::decode(&bytes).ok())
          .map(|entry| entry.last_access_at)
          .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (last_access, key)
      })
      .collect();
    ranked.sort();

    let excess = ranked.len() - target;
    let mut removed = 0;
    for (_, key) in ranked.into_iter().take(excess) {
      match self.store.delete(&key) {
        Ok(()) => removed += 1,
        Err(e) => warn!("failed to evict {}: {}", key, e),
      }
    }

    debug!("evicted {} cache entries", removed);
    removed
  }

  /// Drop every entry whose key starts with the given logical prefix, e.g.
  /// all insights for one user. Returns the number of entries removed.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let _guard = self.guard();
    let keys = match self.store.keys_with_prefix(&Self::store_key(prefix)) {
      Ok(keys) => keys,
      Err(e) => {
        warn!("prefix invalidation scan failed: {}", e);
        return 0;
      }
    };

    let mut removed = 0;
    for key in keys {
      match self.store.delete(&key) {
        Ok(()) => removed += 1,
        Err(e) => warn!("failed to invalidate {}: {}", key, e),
      }
    }

    debug!("invalidated {} entries under {}", removed, prefix);
    removed
  }

  pub fn stats(&self) -> CacheStats {
    let _guard = self.guard();
    CacheStats {
      entries: self.entry_count(),
      total_bytes: self.store.total_bytes(CACHE_PREFIX).unwrap_or(0),
      max_entries: self.max_entries,
    }
  }

  fn entry_count(&self) -> usize {
    self
      .store
      .keys_with_prefix(CACHE_PREFIX)
      .map(|keys| keys.len())
      .unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::{KeyValueStore, MemoryStore};
  use color_eyre::{eyre::eyre, Result};
  use serde_json::json;
  use std::sync::Arc;

  fn cache_with(max_entries: usize) -> (TtlCache, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new());
    let cache = TtlCache::new(store, clock.clone(), max_entries, "v1");
    (cache, clock)
  }

  #[test]
  fn hit_then_expiry() {
    let (cache, clock) = cache_with(50);

    assert!(cache.write("insights:u1:abc", json!({"a": 1}), 1000));
    assert_eq!(cache.read("insights:u1:abc", None), Some(json!({"a": 1})));

    clock.advance_ms(1001);
    assert_eq!(cache.read("insights:u1:abc", None), None);
  }

  #[test]
  fn freshness_boundary() {
    let (cache, clock) = cache_with(50);
    cache.write("k", json!(1), 1000);

    clock.advance_ms(999);
    assert!(cache.read("k", None).is_some());

    clock.advance_ms(2);
    assert!(cache.read("k", None).is_none());
  }

  #[test]
  fn read_side_max_age_only_tightens() {
    let (cache, clock) = cache_with(50);
    cache.write("k", json!(1), 60_000);

    clock.advance_ms(500);
    assert!(cache.read("k", Some(400)).is_none());
    assert!(cache.read("k", Some(1000)).is_some());
    // An override longer than the TTL does not extend freshness
    clock.advance_ms(60_000);
    assert!(cache.read("k", Some(i64::MAX)).is_none());
  }

  #[test]
  fn schema_mismatch_is_a_miss() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let clock: SharedClock = Arc::new(ManualClock::new());

    let v1 = TtlCache::new(store.clone(), clock.clone(), 50, "v1");
    v1.write("k", json!(1), 60_000);

    let v2 = TtlCache::new(store, clock, 50, "v2");
    assert!(v2.read("k", None).is_none());
  }

  #[test]
  fn eviction_keeps_most_recently_accessed() {
    let (cache, clock) = cache_with(3);

    for key in ["a", "b", "c"] {
      cache.write(key, json!(key), 60_000);
      clock.advance_ms(10);
    }

    // Touch "a" so "b" becomes the LRU entry
    cache.read("a", None);
    clock.advance_ms(10);

    cache.write("d", json!("d"), 60_000);

    assert_eq!(cache.stats().entries, 3);
    assert!(cache.read("a", None).is_some());
    assert!(cache.read("b", None).is_none());
    assert!(cache.read("c", None).is_some());
    assert!(cache.read("d", None).is_some());
  }

  #[test]
  fn writing_over_capacity_leaves_exactly_max_entries() {
    let (cache, clock) = cache_with(5);

    for i in 0..9 {
      cache.write(&format!("k{}", i), json!(i), 60_000);
      clock.advance_ms(1);
    }

    assert_eq!(cache.stats().entries, 5);
    // Survivors are the most recently written
    for i in 4..9 {
      assert!(cache.read(&format!("k{}", i), None).is_some(), "k{}", i);
    }
  }

  #[test]
  fn eviction_tie_break_is_by_key() {
    // Same last_access_at everywhere: the smallest keys go first
    let (cache, _clock) = cache_with(2);

    cache.write("b", json!(2), 60_000);
    cache.write("a", json!(1), 60_000);
    cache.write("c", json!(3), 60_000);

    assert!(cache.read("a", None).is_none());
    assert!(cache.read("b", None).is_some());
    assert!(cache.read("c", None).is_some());
  }

  #[test]
  fn rewriting_a_key_does_not_grow_the_cache() {
    let (cache, _clock) = cache_with(3);

    for _ in 0..10 {
      cache.write("same", json!(1), 60_000);
    }
    assert_eq!(cache.stats().entries, 1);
  }

  #[test]
  fn invalidate_prefix_drops_only_matches() {
    let (cache, _clock) = cache_with(50);

    cache.write("insights:u1:a", json!(1), 60_000);
    cache.write("insights:u1:b", json!(2), 60_000);
    cache.write("insights:u2:a", json!(3), 60_000);
    cache.write("user:u1:a", json!(4), 60_000);

    assert_eq!(cache.invalidate_prefix("insights:u1:"), 2);
    assert!(cache.read("insights:u2:a", None).is_some());
    assert!(cache.read("user:u1:a", None).is_some());
  }

  #[test]
  fn corrupt_entry_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new());
    let cache = TtlCache::new(store.clone(), clock, 50, "v1");

    store.set("cache:bad", b"not json").unwrap();
    assert!(cache.read("bad", None).is_none());
  }

  #[test]
  fn parallel_writes_at_capacity_keep_the_bound() {
    let (cache, _clock) = cache_with(50);

    for i in 0..50 {
      cache.write(&format!("seed{:02}", i), json!(i), 60_000);
    }
    assert_eq!(cache.stats().entries, 50);

    let mut handles = Vec::new();
    for t in 0..4 {
      let cache = cache.clone();
      handles.push(std::thread::spawn(move || {
        for i in 0..10 {
          cache.write(&format!("t{}:{}", t, i), json!(i), 60_000);
        }
      }));
    }
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(cache.stats().entries, 50);
  }

  /// Store whose next set fails once, to exercise the evict-and-retry path.
  struct FailNextSetStore {
    inner: MemoryStore,
    fail_next_set: std::sync::atomic::AtomicBool,
  }

  impl KeyValueStore for FailNextSetStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
      self.inner.get(key)
    }
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
      if self.fail_next_set.swap(false, std::sync::atomic::Ordering::SeqCst) {
        return Err(eyre!("storage exhausted"));
      }
      self.inner.set(key, value)
    }
    fn delete(&self, key: &str) -> Result<()> {
      self.inner.delete(key)
    }
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
      self.inner.keys_with_prefix(prefix)
    }
    fn total_bytes(&self, prefix: &str) -> Result<u64> {
      self.inner.total_bytes(prefix)
    }
  }

  #[test]
  fn failed_write_retries_after_an_eviction_pass() {
    let store = Arc::new(FailNextSetStore {
      inner: MemoryStore::new(),
      fail_next_set: std::sync::atomic::AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::new());
    let cache = TtlCache::new(store.clone(), clock.clone(), 3, "v1");

    for key in ["a", "b", "c"] {
      cache.write(key, json!(key), 60_000);
      clock.advance_ms(1);
    }

    store
      .fail_next_set
      .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(cache.write("d", json!("d"), 60_000));

    assert_eq!(cache.stats().entries, 3);
    assert_eq!(cache.read("d", None), Some(json!("d")));
    assert!(cache.read("a", None).is_none());
  }

  /// Store whose writes always fail, to exercise the fail-open paths.
  struct BrokenStore;

  impl KeyValueStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
      Err(eyre!("storage exhausted"))
    }
    fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
      Err(eyre!("storage exhausted"))
    }
    fn delete(&self, _key: &str) -> Result<()> {
      Err(eyre!("storage exhausted"))
    }
    fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
      Err(eyre!("storage exhausted"))
    }
    fn total_bytes(&self, _prefix: &str) -> Result<u64> {
      Err(eyre!("storage exhausted"))
    }
  }

  #[test]
  fn store_failures_are_soft() {
    let cache = TtlCache::new(Arc::new(BrokenStore), Arc::new(ManualClock::new()), 50, "v1");

    assert!(!cache.write("k", json!(1), 1000));
    assert!(cache.read("k", None).is_none());
    assert_eq!(cache.invalidate_prefix("k"), 0);
    assert_eq!(cache.stats().entries, 0);
  }
}
