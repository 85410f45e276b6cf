//! Install/activate sequencing for the worker.
//!
//! Partitions are created eagerly during install for the shell and offline
//! fallbacks, lazily on first write everywhere else, and destroyed during
//! activation when their name drops out of the current registry.

use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;
use tracing::info;
use url::Url;

use crate::cache::store::CacheStore;
use crate::net::{request_key, FetchRequest, Network};
use crate::registry::{PartitionKind, Registry};

/// Worker lifecycle states, driven by host events rather than timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Active,
}

/// Controls partition creation and teardown across worker versions.
pub struct Lifecycle {
  state: Mutex<WorkerState>,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(WorkerState::Installing),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, next: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
  }

  /// Precache the app shell and offline fallbacks.
  ///
  /// Any failed precache fetch fails the whole install; a corrupt shell must
  /// never become active. Precache writes skip the storage-eligibility gate
  /// because the registry itself names these assets.
  pub async fn install<N: Network>(
    &self,
    store: &CacheStore,
    network: &N,
    registry: &Registry,
  ) -> Result<()> {
    self.set_state(WorkerState::Installing);

    let shell = registry.partition(PartitionKind::Shell);
    for url in &registry.shell_assets {
      precache(store, network, &shell.name, url).await?;
    }

    let offline = registry.partition(PartitionKind::Offline);
    for url in &registry.offline_assets {
      precache(store, network, &offline.name, url).await?;
    }

    self.set_state(WorkerState::Installed);
    info!(
      shell = registry.shell_assets.len(),
      offline = registry.offline_assets.len(),
      "install complete"
    );
    Ok(())
  }

  /// Delete partitions from older versions, register current ones, and take
  /// control. Returns the names that were dropped.
  pub fn activate(&self, store: &CacheStore, registry: &Registry) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    let current: Vec<&str> = registry.partitions().iter().map(|p| p.name.as_str()).collect();

    let mut dropped = Vec::new();
    for name in store.partition_names()? {
      if !current.contains(&name.as_str()) {
        store.drop_partition(&name)?;
        dropped.push(name);
      }
    }

    for name in &current {
      store.register_partition(name)?;
    }

    self.set_state(WorkerState::Active);
    if !dropped.is_empty() {
      info!(?dropped, "removed stale cache partitions");
    }
    Ok(dropped)
  }
}

async fn precache<N: Network>(
  store: &CacheStore,
  network: &N,
  partition: &str,
  url: &Url,
) -> Result<()> {
  let request = FetchRequest::get(url.clone());
  let response = network
    .fetch(&request)
    .await
    .map_err(|e| eyre!("Precache fetch failed for {}: {}", url, e))?;

  if !response.is_success() {
    return Err(eyre!("Precache of {} returned status {}", url, response.status));
  }

  store.put(partition, &request_key(url, None), url.as_str(), &response)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockNetwork;
  use crate::net::FetchResponse;
  use crate::registry::test_registry;
  use http::StatusCode;

  fn routed_network(registry: &Registry) -> MockNetwork {
    let network = MockNetwork::new();
    for url in &registry.shell_assets {
      network.route(url.as_str(), 200, b"shell asset");
    }
    for url in &registry.offline_assets {
      network.route(url.as_str(), 200, b"offline asset");
    }
    network
  }

  #[tokio::test]
  async fn test_cold_install_precaches_shell() {
    let registry = test_registry("v1");
    let store = CacheStore::open_in_memory().unwrap();
    let network = routed_network(&registry);
    let lifecycle = Lifecycle::new();

    lifecycle.install(&store, &network, &registry).await.unwrap();

    assert_eq!(lifecycle.state(), WorkerState::Installed);
    // Exactly the three declared shell assets
    let shell = &registry.partition(PartitionKind::Shell).name;
    assert_eq!(store.count(shell).unwrap(), 3);
    for url in &registry.shell_assets {
      assert!(store.get(shell, &request_key(url, None)).unwrap().is_some());
    }
    let offline = &registry.partition(PartitionKind::Offline).name;
    assert_eq!(store.count(offline).unwrap(), 2);
  }

  #[tokio::test]
  async fn test_install_fails_on_missing_asset() {
    let registry = test_registry("v1");
    let store = CacheStore::open_in_memory().unwrap();
    let network = routed_network(&registry);
    network.route("https://app.example/manifest.json", 404, b"gone");
    let lifecycle = Lifecycle::new();

    let result = lifecycle.install(&store, &network, &registry).await;

    assert!(result.is_err());
    assert_eq!(lifecycle.state(), WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_activate_drops_stale_partitions() {
    let store = CacheStore::open_in_memory().unwrap();
    let old = FetchResponse {
      status: StatusCode::OK,
      headers: Vec::new(),
      body: b"old".to_vec(),
    };
    store.put("shelf-static-v1", "k", "https://app.example/a.css", &old).unwrap();

    let registry = test_registry("v2");
    let lifecycle = Lifecycle::new();
    let dropped = lifecycle.activate(&store, &registry).unwrap();

    assert_eq!(dropped, vec!["shelf-static-v1"]);
    assert_eq!(lifecycle.state(), WorkerState::Active);

    let names = store.partition_names().unwrap();
    assert!(!names.contains(&"shelf-static-v1".to_string()));
    // New partitions exist, possibly empty
    assert!(names.contains(&"shelf-static-v2".to_string()));
    assert_eq!(store.count("shelf-static-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_keeps_current_partitions() {
    let registry = test_registry("v1");
    let store = CacheStore::open_in_memory().unwrap();
    let network = routed_network(&registry);
    let lifecycle = Lifecycle::new();

    lifecycle.install(&store, &network, &registry).await.unwrap();
    let dropped = lifecycle.activate(&store, &registry).unwrap();

    assert!(dropped.is_empty());
    let shell = &registry.partition(PartitionKind::Shell).name;
    assert_eq!(store.count(shell).unwrap(), 3);
  }
}
