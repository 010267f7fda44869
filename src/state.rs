//! Unified application state over the cache, coordinator, queue, and bus.
//!
//! This is the orchestration layer UI code talks to. Each logical resource
//! (user profile, dashboard stats, AI insights) is fetched through the
//! request coordinator and the TTL cache; mutations go through the sync
//! queue; invalidation events mark the affected resources stale and trigger
//! a background re-fetch.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::api::{ApiError, DataApi, InsightProvider};
use crate::bus::{reasons, InvalidationBus, Subscription};
use crate::cache::{build_key, CacheStats, TtlCache};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::coordinator::RequestCoordinator;
use crate::queue::{Priority, SyncQueue, TaskExecutor, TaskKind};
use crate::store::SharedStore;

/// The logical resources the dashboard works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
  UserProfile,
  DashboardStats,
  Insights,
}

impl Resource {
  pub const ALL: [Resource; 3] = [
    Resource::UserProfile,
    Resource::DashboardStats,
    Resource::Insights,
  ];

  pub fn logical_name(self) -> &'static str {
    match self {
      Resource::UserProfile => "user",
      Resource::DashboardStats => "dashboard",
      Resource::Insights => "insights",
    }
  }

  /// Reason published when this resource changes.
  pub fn invalidation_reason(self) -> &'static str {
    match self {
      Resource::UserProfile => reasons::USER_DATA_CHANGE,
      Resource::DashboardStats => reasons::DASHBOARD_DATA_CHANGE,
      Resource::Insights => reasons::INSIGHTS_CHANGE,
    }
  }

  fn ttl_ms(self, config: &SyncConfig) -> i64 {
    match self {
      Resource::UserProfile => config.ttl.user_ms,
      Resource::DashboardStats => config.ttl.dashboard_ms,
      Resource::Insights => config.ttl.insights_ms,
    }
  }

  /// Which resources a published reason invalidates. Profile data feeds the
  /// dashboard and the insight fingerprints, so a user change cascades.
  fn affected_by(reason: &str) -> Vec<Resource> {
    match reason {
      reasons::USER_DATA_CHANGE => Self::ALL.to_vec(),
      reasons::DASHBOARD_DATA_CHANGE => vec![Resource::DashboardStats, Resource::Insights],
      reasons::INSIGHTS_CHANGE => vec![Resource::Insights],
      reasons::MANUAL_REFRESH => Self::ALL.to_vec(),
      _ => Vec::new(),
    }
  }
}

/// Per-resource UI-facing flags. Plain state, not hidden inside the cache.
#[derive(Debug, Clone, Default)]
pub struct SliceState {
  pub loading: bool,
  pub initialized: bool,
  pub error: Option<String>,
}

/// Canonical client-side state: one instance per application, constructed at
/// startup and shared by reference. No globals.
pub struct UnifiedState {
  cache: TtlCache,
  coordinator: RequestCoordinator<Value>,
  queue: Arc<SyncQueue>,
  bus: InvalidationBus,
  api: Arc<dyn DataApi>,
  insights: Arc<dyn InsightProvider>,
  config: SyncConfig,
  owner_id: String,
  /// Inputs that determine resource content; part of every cache key.
  profile_inputs: Mutex<Value>,
  slices: Mutex<HashMap<Resource, SliceState>>,
  subscription: Mutex<Option<Subscription>>,
}

impl UnifiedState {
  pub fn new(
    store: SharedStore,
    clock: SharedClock,
    api: Arc<dyn DataApi>,
    insights: Arc<dyn InsightProvider>,
    config: SyncConfig,
    owner_id: &str,
  ) -> Arc<Self> {
    let bus = InvalidationBus::new();
    let cache = TtlCache::new(
      store.clone(),
      clock.clone(),
      config.max_entries,
      &config.schema_version,
    );

    // Queue tasks carry {"resource": id, "body": value} payloads and replay
    // against the data API.
    let executor: TaskExecutor = Box::new({
      let api = Arc::clone(&api);
      move |task| {
        let api = Arc::clone(&api);
        Box::pin(async move {
          let resource_id = task
            .payload
            .get("resource")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

          match task.kind {
            TaskKind::Mutate => {
              let body = task.payload.get("body").cloned().unwrap_or(Value::Null);
              api.mutate(&resource_id, body).await.map(|_| ())
            }
            TaskKind::Refresh => api.fetch(&resource_id).await.map(|_| ()),
            TaskKind::InvalidateNotify => Ok(()),
          }
        })
      }
    });

    let queue = Arc::new(SyncQueue::new(
      store,
      clock,
      bus.clone(),
      &config,
      executor,
    ));

    let state = Arc::new(Self {
      cache,
      coordinator: RequestCoordinator::new(),
      queue,
      bus: bus.clone(),
      api,
      insights,
      config,
      owner_id: owner_id.to_string(),
      profile_inputs: Mutex::new(json!({})),
      slices: Mutex::new(HashMap::new()),
      subscription: Mutex::new(None),
    });

    let subscription = bus.subscribe({
      let weak = Arc::downgrade(&state);
      move |reason| {
        if let Some(state) = weak.upgrade() {
          state.on_invalidation(reason);
        }
      }
    });
    if let Ok(mut slot) = state.subscription.lock() {
      *slot = Some(subscription);
    }

    state
  }

  /// Fetch a resource, serving from cache when fresh.
  pub async fn fetch(&self, resource: Resource) -> Result<Value, ApiError> {
    self.fetch_inner(resource, false).await
  }

  /// Fetch a resource, bypassing the cache read. The result is still cached
  /// and concurrent refreshes are still coordinated.
  pub async fn refresh(&self, resource: Resource) -> Result<Value, ApiError> {
    self.fetch_inner(resource, true).await
  }

  async fn fetch_inner(&self, resource: Resource, force: bool) -> Result<Value, ApiError> {
    let inputs = self.profile_inputs();
    let key = build_key(resource.logical_name(), &self.owner_id, &inputs);

    self.update_slice(resource, |s| s.loading = true);

    let cache = self.cache.clone();
    let api = Arc::clone(&self.api);
    let insights = Arc::clone(&self.insights);
    let ttl_ms = resource.ttl_ms(&self.config);
    let resource_id = format!("{}/{}", resource.logical_name(), self.owner_id);
    let op_key = key.clone();

    let result = self
      .coordinator
      .coordinate(&key, move || async move {
        if !force {
          if let Some(hit) = cache.read(&op_key, None) {
            return Ok(hit);
          }
        }

        let value = match resource {
          Resource::Insights => insights.generate(inputs).await?,
          _ => api.fetch(&resource_id).await?,
        };

        cache.write(&op_key, value.clone(), ttl_ms);
        Ok(value)
      })
      .await;

    match &result {
      Ok(_) => self.update_slice(resource, |s| {
        s.loading = false;
        s.initialized = true;
        s.error = None;
      }),
      Err(e) => {
        let message = e.message.clone();
        self.update_slice(resource, move |s| {
          s.loading = false;
          s.error = Some(message);
        });
      }
    }

    result
  }

  /// Queue a mutation for the backend. It retries transparently until it
  /// succeeds (publishing the resource's invalidation reason) or exhausts
  /// its attempts. Returns the task id.
  pub async fn mutate(&self, resource: Resource, body: Value) -> color_eyre::Result<String> {
    let payload = json!({
      "resource": format!("{}/{}", resource.logical_name(), self.owner_id),
      "body": body,
    });

    self
      .queue
      .enqueue(
        TaskKind::Mutate,
        Priority::Normal,
        payload,
        Some(resource.invalidation_reason().to_string()),
      )
      .await
  }

  fn on_invalidation(self: Arc<Self>, reason: &str) {
    let affected = Resource::affected_by(reason);
    if affected.is_empty() {
      return;
    }

    for resource in &affected {
      self.update_slice(*resource, |s| s.initialized = false);
      // Drop every cached variant of the resource, not just the current key
      self
        .cache
        .invalidate_prefix(&format!("{}:{}:", resource.logical_name(), self.owner_id));
    }

    // Re-fetch in the background when a runtime is available; otherwise the
    // stale flags alone make the next fetch repopulate.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      for resource in affected {
        let state = Arc::clone(&self);
        handle.spawn(async move {
          if let Err(e) = state.refresh(resource).await {
            warn!("background refresh of {:?} failed: {}", resource, e);
          }
        });
      }
    }
  }

  /// Replace the fingerprint inputs (profile subset, onboarding answers,
  /// dashboard stats). Subsequent fetches derive new cache keys, so entries
  /// for the old inputs simply fall out of use.
  pub fn set_profile_inputs(&self, inputs: Value) {
    if let Ok(mut current) = self.profile_inputs.lock() {
      *current = inputs;
    }
  }

  pub fn profile_inputs(&self) -> Value {
    self
      .profile_inputs
      .lock()
      .map(|v| v.clone())
      .unwrap_or(Value::Null)
  }

  /// Current flags for a resource slice.
  pub fn slice(&self, resource: Resource) -> SliceState {
    self
      .slices
      .lock()
      .ok()
      .and_then(|slices| slices.get(&resource).cloned())
      .unwrap_or_default()
  }

  fn update_slice<F: FnOnce(&mut SliceState)>(&self, resource: Resource, f: F) {
    if let Ok(mut slices) = self.slices.lock() {
      f(slices.entry(resource).or_default());
    }
  }

  /// The invalidation bus, for external publishers and subscribers.
  pub fn bus(&self) -> &InvalidationBus {
    &self.bus
  }

  /// The sync queue, for connectivity wiring and periodic drains.
  pub fn queue(&self) -> &Arc<SyncQueue> {
    &self.queue
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }
}
