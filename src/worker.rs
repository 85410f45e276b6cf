//! The worker facade: fetch interception, message protocol, sync and push.
//!
//! This is the call graph the host adapter feeds events into. Each handler
//! is an ordinary async function; nothing here depends on a simulated event
//! target.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::evict;
use crate::cache::store::CacheStore;
use crate::cache::strategy::StrategyEngine;
use crate::classify::{classify, Classification};
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::net::{FetchRequest, FetchResponse, Network};
use crate::outbox::{Outbox, StoreName};
use crate::push::{notification_for, parse_payload, Notification};
use crate::registry::Registry;
use crate::sync::SyncCoordinator;

/// Commands callers post over the message channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  /// Force immediate activation without waiting for old pages to close.
  SkipWaiting,
  /// Enqueue an analytics batch for background delivery.
  CacheAnalytics { payload: Value },
  /// Enqueue a form submission for background delivery.
  CacheForm { payload: Value },
  /// Reply with partition names and the active version.
  GetCacheStatus,
  /// Drop a single named partition.
  ClearCache { partition: String },
}

/// Reply for messages that produce one.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MessageReply {
  Status(CacheStatus),
  Cleared { cleared: String },
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
  pub version: String,
  pub partitions: Vec<PartitionStatus>,
}

#[derive(Debug, Serialize)]
pub struct PartitionStatus {
  pub name: String,
  pub entries: usize,
}

/// Outcome of intercepting one request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// The request bypasses the cache layer; the caller forwards it untouched.
  Skip,
  Response(FetchResponse),
}

/// Owns the registry, stores and network client, and exposes the handler
/// surface the host adapter drives.
pub struct Worker<N: Network> {
  registry: Arc<Registry>,
  store: Arc<CacheStore>,
  outbox: Arc<Outbox>,
  network: Arc<N>,
  lifecycle: Lifecycle,
  strategies: StrategyEngine<N>,
  sync: SyncCoordinator<N>,
}

impl<N: Network + 'static> Worker<N> {
  pub fn new(registry: Registry, store: CacheStore, outbox: Outbox, network: N) -> Self {
    let registry = Arc::new(registry);
    let store = Arc::new(store);
    let outbox = Arc::new(outbox);
    let network = Arc::new(network);

    let strategies =
      StrategyEngine::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&network));
    let sync =
      SyncCoordinator::new(Arc::clone(&registry), Arc::clone(&outbox), Arc::clone(&network));

    Self {
      registry,
      store,
      outbox,
      network,
      lifecycle: Lifecycle::new(),
      strategies,
      sync,
    }
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  #[cfg(test)]
  pub(crate) fn network(&self) -> &N {
    &self.network
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  /// Precache the shell and offline partitions. Fails hard on any miss.
  pub async fn install(&self) -> Result<()> {
    self
      .lifecycle
      .install(&self.store, self.network.as_ref(), &self.registry)
      .await
  }

  /// Roll partitions over to the current registry and take control.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.lifecycle.activate(&self.store, &self.registry)
  }

  /// Intercept one request: classify, then resolve through the matching
  /// strategy.
  pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
    match classify(request, &self.registry) {
      Classification::Skip => Ok(FetchOutcome::Skip),
      Classification::Handle {
        partition,
        strategy,
      } => {
        let response = self.strategies.handle(request, partition, strategy).await?;
        Ok(FetchOutcome::Response(response))
      }
    }
  }

  /// Forward a request past the cache layer entirely.
  pub async fn forward(&self, request: &FetchRequest) -> Result<FetchResponse> {
    self.network.fetch(request).await
  }

  pub async fn handle_message(&self, message: Message) -> Result<Option<MessageReply>> {
    match message {
      Message::SkipWaiting => {
        self.activate()?;
        info!("skip-waiting: activated immediately");
        Ok(None)
      }
      Message::CacheAnalytics { payload } => {
        self.enqueue_best_effort(StoreName::Analytics, &payload);
        Ok(None)
      }
      Message::CacheForm { payload } => {
        self.enqueue_best_effort(StoreName::Forms, &payload);
        Ok(None)
      }
      Message::GetCacheStatus => Ok(Some(MessageReply::Status(self.status()?))),
      Message::ClearCache { partition } => {
        self.store.drop_partition(&partition)?;
        Ok(Some(MessageReply::Cleared { cleared: partition }))
      }
    }
  }

  // Outbox persistence is best effort: a failure is logged, never surfaced,
  // so it cannot break the caller's fetch handling.
  fn enqueue_best_effort(&self, store: StoreName, payload: &Value) {
    if let Err(err) = self.outbox.enqueue(store, payload) {
      warn!(store = store.as_str(), "failed to persist outbox item: {err:#}");
    }
  }

  /// Drain the outbox store behind a sync tag. Errors propagate so the host
  /// scheduler can retry within the task's bounds.
  pub async fn handle_sync(&self, tag: &str) -> Result<usize> {
    self.sync.run(tag).await
  }

  /// Map a raw push body to the notification to display.
  pub fn handle_push(&self, raw: &[u8]) -> Notification {
    notification_for(&parse_payload(raw))
  }

  /// Periodic maintenance: run eviction across every partition.
  pub fn cleanup(&self) -> Result<usize> {
    let mut removed = 0;
    for partition in self.registry.partitions() {
      removed += evict::evict(&self.store, partition)?;
    }
    Ok(removed)
  }

  /// Pending item count for one outbox store.
  pub fn pending(&self, store: StoreName) -> Result<usize> {
    self.outbox.pending_count(store)
  }

  pub fn status(&self) -> Result<CacheStatus> {
    let mut partitions = Vec::new();
    for name in self.store.partition_names()? {
      partitions.push(PartitionStatus {
        entries: self.store.count(&name)?,
        name,
      });
    }
    Ok(CacheStatus {
      version: self.registry.version.clone(),
      partitions,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classify::BYPASS_HEADER;
  use crate::net::mock::MockNetwork;
  use crate::registry::test_registry;
  use http::HeaderValue;
  use serde_json::json;
  use url::Url;

  fn worker() -> Worker<MockNetwork> {
    let registry = test_registry("v1");
    let network = MockNetwork::new();
    for url in registry.shell_assets.iter().chain(&registry.offline_assets) {
      network.route(url.as_str(), 200, b"asset");
    }
    Worker::new(
      registry,
      CacheStore::open_in_memory().unwrap(),
      Outbox::open_in_memory().unwrap(),
      network,
    )
  }

  #[tokio::test]
  async fn test_message_parsing_matches_wire_format() {
    let message: Message =
      serde_json::from_value(json!({"type": "CACHE_FORM", "payload": {"name": "x"}})).unwrap();
    assert!(matches!(message, Message::CacheForm { .. }));

    let message: Message = serde_json::from_value(json!({"type": "SKIP_WAITING"})).unwrap();
    assert!(matches!(message, Message::SkipWaiting));

    let message: Message = serde_json::from_value(json!({"type": "GET_CACHE_STATUS"})).unwrap();
    assert!(matches!(message, Message::GetCacheStatus));
  }

  #[tokio::test]
  async fn test_cache_form_message_enqueues_one_item() {
    let worker = worker();
    let payload = json!({"name": "x"});
    let reply = worker
      .handle_message(Message::CacheForm {
        payload: payload.clone(),
      })
      .await
      .unwrap();

    assert!(reply.is_none());
    let pending = worker.outbox.list_pending(StoreName::Forms).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, payload);
    assert_eq!(worker.pending(StoreName::Analytics).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_analytics_message_targets_analytics_store() {
    let worker = worker();
    worker
      .handle_message(Message::CacheAnalytics {
        payload: json!({"event": "pageview"}),
      })
      .await
      .unwrap();

    assert_eq!(worker.pending(StoreName::Analytics).unwrap(), 1);
    assert_eq!(worker.pending(StoreName::Forms).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates() {
    let worker = worker();
    assert_eq!(worker.state(), WorkerState::Installing);

    worker.handle_message(Message::SkipWaiting).await.unwrap();

    assert_eq!(worker.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_status_lists_partitions_and_version() {
    let worker = worker();
    worker.install().await.unwrap();
    worker.activate().unwrap();

    let reply = worker.handle_message(Message::GetCacheStatus).await.unwrap();
    let status = match reply {
      Some(MessageReply::Status(status)) => status,
      other => panic!("expected status reply, got {other:?}"),
    };

    assert_eq!(status.version, "v1");
    assert_eq!(status.partitions.len(), 6);
    let shell = status
      .partitions
      .iter()
      .find(|p| p.name == "shelf-shell-v1")
      .unwrap();
    assert_eq!(shell.entries, 3);
  }

  #[tokio::test]
  async fn test_clear_cache_drops_partition() {
    let worker = worker();
    worker.install().await.unwrap();

    worker
      .handle_message(Message::ClearCache {
        partition: "shelf-shell-v1".to_string(),
      })
      .await
      .unwrap();

    assert_eq!(worker.store.count("shelf-shell-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_fetch_skip_for_bypass_header() {
    let worker = worker();
    let mut request = FetchRequest::get(Url::parse("https://app.example/index.html").unwrap());
    request
      .headers
      .insert(BYPASS_HEADER, HeaderValue::from_static("1"));

    let outcome = worker.handle_fetch(&request).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Skip));
  }

  #[tokio::test]
  async fn test_fetch_resolves_classified_request() {
    let worker = worker();
    worker
      .network
      .route("https://app.example/api/products", 200, b"[1]");

    let request = FetchRequest::get(Url::parse("https://app.example/api/products").unwrap());
    let outcome = worker.handle_fetch(&request).await.unwrap();

    match outcome {
      FetchOutcome::Response(response) => assert_eq!(response.body, b"[1]"),
      FetchOutcome::Skip => panic!("API request must not skip"),
    }
  }

  #[tokio::test]
  async fn test_push_maps_to_notification() {
    let worker = worker();
    let notification = worker.handle_push(br#"{"body": "hi", "url": "/offers"}"#);
    assert_eq!(notification.body, "hi");
    assert_eq!(notification.url, "/offers");
  }

  #[tokio::test]
  async fn test_cleanup_prunes_every_partition() {
    let worker = worker();
    let api = worker.registry.partition(crate::registry::PartitionKind::Api);
    let name = api.name.clone();
    for i in 0..api.max_entries + 5 {
      worker
        .store
        .put(
          &name,
          &format!("k{i}"),
          "https://app.example/api/x",
          &FetchResponse {
            status: http::StatusCode::OK,
            headers: Vec::new(),
            body: b"x".to_vec(),
          },
        )
        .unwrap();
    }

    let removed = worker.cleanup().unwrap();
    assert!(removed >= 5);
    assert!(worker.store.count(&name).unwrap() <= api.max_entries);
  }
}
