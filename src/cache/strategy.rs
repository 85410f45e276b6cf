//! Cache strategies: the precedence of cache vs network per request class.
//!
//! Every strategy shares the same shape: resolve a classified request into a
//! response, or fail hard. Writes are gated by storage eligibility and always
//! followed by an eviction pass, so worst-case partition size stays bounded
//! deterministically.

use chrono::Duration;
use color_eyre::Result;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

use super::evict;
use super::store::CacheStore;
use crate::classify::{storable, Strategy};
use crate::net::{request_key, FetchRequest, FetchResponse, Network};
use crate::registry::{PartitionKind, Registry};
use crate::task::spawn_detached;

/// Hours a cache-first entry may be served before a background refresh.
const REFRESH_AFTER_HOURS: i64 = 24;

/// Executes cache strategies over the partitioned store.
pub struct StrategyEngine<N: Network> {
  registry: Arc<Registry>,
  store: Arc<CacheStore>,
  network: Arc<N>,
}

impl<N: Network> Clone for StrategyEngine<N> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
    }
  }
}

impl<N: Network + 'static> StrategyEngine<N> {
  pub fn new(registry: Arc<Registry>, store: Arc<CacheStore>, network: Arc<N>) -> Self {
    Self {
      registry,
      store,
      network,
    }
  }

  /// Resolve a classified request. Always yields a response or a hard error
  /// the caller treats as a failed fetch.
  pub async fn handle(
    &self,
    request: &FetchRequest,
    partition: PartitionKind,
    strategy: Strategy,
  ) -> Result<FetchResponse> {
    match strategy {
      Strategy::CacheFirst => self.cache_first(request, partition).await,
      Strategy::NetworkFirst => self.network_first(request, partition).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, partition).await,
    }
  }

  async fn cache_first(
    &self,
    request: &FetchRequest,
    partition: PartitionKind,
  ) -> Result<FetchResponse> {
    let name = &self.registry.partition(partition).name;
    let key = self.key_for(request, partition);

    if let Some(cached) = self.store.get(name, &key)? {
      if cached.age() > Duration::hours(REFRESH_AFTER_HOURS) {
        self.refresh_in_background(request.clone(), partition);
      }
      return Ok(cached.response);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_eligible(request, partition, &response)?;
        Ok(response)
      }
      Err(err) => {
        if request.is_navigation() {
          if let Some(fallback) = self.offline_page()? {
            debug!(url = %request.url, "serving offline page for failed navigation");
            return Ok(fallback);
          }
        }
        Err(err)
      }
    }
  }

  async fn network_first(
    &self,
    request: &FetchRequest,
    partition: PartitionKind,
  ) -> Result<FetchResponse> {
    let name = &self.registry.partition(partition).name;
    let key = self.key_for(request, partition);

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_eligible(request, partition, &response)?;
        Ok(response)
      }
      Err(err) => {
        if let Some(cached) = self.store.get(name, &key)? {
          debug!(url = %request.url, "network failed, serving cached response");
          return Ok(cached.response);
        }
        if partition == PartitionKind::Api {
          return Ok(offline_api_response());
        }
        if request.is_navigation() {
          if let Some(fallback) = self.offline_page()? {
            return Ok(fallback);
          }
        }
        Err(err)
      }
    }
  }

  async fn stale_while_revalidate(
    &self,
    request: &FetchRequest,
    partition: PartitionKind,
  ) -> Result<FetchResponse> {
    let name = &self.registry.partition(partition).name;
    let key = self.key_for(request, partition);

    if let Some(cached) = self.store.get(name, &key)? {
      // Revalidate for next time; the outcome never touches this response.
      self.refresh_in_background(request.clone(), partition);
      return Ok(cached.response);
    }

    let response = self.network.fetch(request).await?;
    self.store_if_eligible(request, partition, &response)?;
    Ok(response)
  }

  /// Dynamic pages vary by accept class so the HTML and JSON renditions of
  /// one URL don't collide. Precached keys stay URL-only so fallback lookups
  /// always match.
  fn key_for(&self, request: &FetchRequest, partition: PartitionKind) -> String {
    let vary = (partition == PartitionKind::Dynamic).then(|| accept_class(request));
    request_key(&request.url, vary)
  }

  fn store_if_eligible(
    &self,
    request: &FetchRequest,
    partition: PartitionKind,
    response: &FetchResponse,
  ) -> Result<()> {
    if !response.is_success() || !storable(request, &self.registry) {
      return Ok(());
    }

    let partition = self.registry.partition(partition);
    let key = self.key_for(request, partition.kind);
    self
      .store
      .put(&partition.name, &key, request.url.as_str(), response)?;
    evict::evict(&self.store, partition)?;
    Ok(())
  }

  fn refresh_in_background(&self, request: FetchRequest, partition: PartitionKind) {
    let engine = self.clone();
    spawn_detached("background refresh", async move {
      let response = engine.network.fetch(&request).await?;
      engine.store_if_eligible(&request, partition, &response)
    });
  }

  fn offline_page(&self) -> Result<Option<FetchResponse>> {
    let offline = self.registry.partition(PartitionKind::Offline);
    let key = request_key(&self.registry.offline_page, None);
    Ok(self.store.get(&offline.name, &key)?.map(|c| c.response))
  }
}

/// Synthesized response for API requests that fail with no cached copy,
/// letting the calling UI render a graceful offline state.
fn offline_api_response() -> FetchResponse {
  FetchResponse::json(
    StatusCode::SERVICE_UNAVAILABLE,
    &serde_json::json!({
      "error": "Offline",
      "offline": true,
      "cached": false,
    }),
  )
}

fn accept_class(request: &FetchRequest) -> &'static str {
  match request.header("accept") {
    Some(a) if a.contains("text/html") => "html",
    Some(a) if a.contains("application/json") => "json",
    _ => "any",
  }
}
