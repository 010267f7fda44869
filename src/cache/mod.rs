//! Fingerprint-keyed TTL cache with LRU eviction.
//!
//! This module provides the caching half of the sync core:
//! - Entries carry their own TTL and a schema-version tag
//! - Keys embed a fingerprint of the inputs that determine the content, so
//!   changed inputs naturally invalidate old entries
//! - Growth is bounded by LRU eviction
//! - Storage failures degrade to cache misses (fail-open)

mod entry;
mod key;
mod ttl;

pub use entry::CacheEntry;
pub use key::{build_key, fingerprint};
pub use ttl::{CacheStats, TtlCache, CACHE_PREFIX, DEFAULT_MAX_ENTRIES};
