//! External collaborator boundaries.
//!
//! The sync core never talks to a concrete backend directly; it goes through
//! the traits here. `HttpDataApi` is the production adapter for the JSON REST
//! surface; tests substitute their own implementations.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use tokio::sync::watch;
use url::Url;

/// Failure from an external operation, classified for retry decisions.
///
/// Clone-able on purpose: one failure fans out to every coordinated waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
  pub message: String,
  /// False for validation-style failures (4xx-equivalent) that retrying
  /// cannot fix.
  pub retryable: bool,
}

impl ApiError {
  pub fn retryable(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: true,
    }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: false,
    }
  }
}

impl fmt::Display for ApiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.message)
  }
}

impl std::error::Error for ApiError {}

/// Abstract data API: fetch and mutate JSON resources.
pub trait DataApi: Send + Sync {
  fn fetch(&self, resource_id: &str) -> BoxFuture<'static, Result<Value, ApiError>>;

  fn mutate(&self, resource_id: &str, payload: Value)
    -> BoxFuture<'static, Result<Value, ApiError>>;
}

/// AI insight provider. Same shape as the data API but expected to be slow
/// (seconds), which is why its results are cached with long TTLs and fetches
/// are coordinated.
pub trait InsightProvider: Send + Sync {
  fn generate(&self, context: Value) -> BoxFuture<'static, Result<Value, ApiError>>;
}

/// JSON REST adapter for `DataApi`.
#[derive(Clone)]
pub struct HttpDataApi {
  client: reqwest::Client,
  base: Url,
}

impl HttpDataApi {
  pub fn new(base_url: &str) -> Result<Self> {
    let base = Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL: {}", e))?;

    Ok(Self {
      client: reqwest::Client::new(),
      base,
    })
  }

  fn resource_url(&self, resource_id: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(resource_id)
      .map_err(|e| ApiError::permanent(format!("Invalid resource id {}: {}", resource_id, e)))
  }
}

/// Map a response to a JSON value, classifying failures: client errors are
/// permanent, everything else is worth retrying.
async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
  let status = response.status();

  if status.is_success() {
    response
      .json::<Value>()
      .await
      .map_err(|e| ApiError::retryable(format!("Failed to parse response body: {}", e)))
  } else if status.is_client_error() {
    Err(ApiError::permanent(format!(
      "Request rejected with status {}",
      status
    )))
  } else {
    Err(ApiError::retryable(format!(
      "Request failed with status {}",
      status
    )))
  }
}

impl DataApi for HttpDataApi {
  fn fetch(&self, resource_id: &str) -> BoxFuture<'static, Result<Value, ApiError>> {
    let client = self.client.clone();
    let url = self.resource_url(resource_id);

    Box::pin(async move {
      let response = client
        .get(url?)
        .send()
        .await
        .map_err(|e| ApiError::retryable(format!("Request failed: {}", e)))?;
      read_json(response).await
    })
  }

  fn mutate(
    &self,
    resource_id: &str,
    payload: Value,
  ) -> BoxFuture<'static, Result<Value, ApiError>> {
    let client = self.client.clone();
    let url = self.resource_url(resource_id);

    Box::pin(async move {
      let response = client
        .post(url?)
        .json(&payload)
        .send()
        .await
        .map_err(|e| ApiError::retryable(format!("Request failed: {}", e)))?;
      read_json(response).await
    })
  }
}

/// Online/offline signal supplied by the environment.
///
/// The sync queue watches this to gate its drain loop; any component can
/// check the current value.
pub struct ConnectivitySignal {
  tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx }
  }

  pub fn set_online(&self, online: bool) {
    // send_replace so the value updates even with no active subscribers
    self.tx.send_replace(online);
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Subscribe to transitions. Receivers see the latest value on change.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for ConnectivitySignal {
  fn default() -> Self {
    Self::new(true)
  }
}
