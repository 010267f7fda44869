//! Client-side data synchronization and cache core.
//!
//! This crate is the data layer a dashboard UI links against. It owns:
//!
//! - a fingerprint-keyed TTL cache with LRU eviction over a persistent
//!   key/value store ([`cache`], [`store`])
//! - deduplication of concurrent fetches for the same resource
//!   ([`coordinator`])
//! - an invalidation broadcast between dependent caches ([`bus`])
//! - a persisted, priority-aware retry queue for mutations that drains when
//!   connectivity allows ([`queue`])
//! - an orchestrator composing all of the above per logical resource
//!   ([`state`])
//!
//! The external API, the AI insight provider, and the connectivity signal are
//! trait boundaries in [`api`]; nothing here depends on a concrete backend.

pub mod api;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod queue;
pub mod state;
pub mod store;

pub use api::{ApiError, ConnectivitySignal, DataApi, HttpDataApi, InsightProvider};
pub use bus::{InvalidationBus, Subscription};
pub use cache::{CacheStats, TtlCache};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::SyncConfig;
pub use coordinator::RequestCoordinator;
pub use queue::{Priority, SyncQueue, SyncTask, TaskKind};
pub use state::{Resource, SliceState, UnifiedState};
pub use store::{KeyValueStore, MemoryStore, SharedStore, SqliteStore};
