//! Background sync: drains outbox stores against their sync tasks.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;

use crate::net::{FetchRequest, FetchResponse, Network};
use crate::outbox::{Outbox, OutboxItem};
use crate::registry::{Registry, SyncTask};

/// Delivers pending outbox items when the host signals a sync tag.
///
/// One pass per invocation; retry scheduling belongs to the host adapter,
/// bounded by the task descriptor's `max_retries`.
pub struct SyncCoordinator<N: Network> {
  registry: Arc<Registry>,
  outbox: Arc<Outbox>,
  network: Arc<N>,
}

impl<N: Network> SyncCoordinator<N> {
  pub fn new(registry: Arc<Registry>, outbox: Arc<Outbox>, network: Arc<N>) -> Self {
    Self {
      registry,
      outbox,
      network,
    }
  }

  /// Drain the store behind `tag`. Returns the number of items delivered.
  ///
  /// Items go out strictly in enqueue order, one at a time, and each is
  /// removed only after a confirmed HTTP success. The first failure aborts
  /// the run so the scheduler retries a fresh pass instead of silently
  /// skipping items.
  pub async fn run(&self, tag: &str) -> Result<usize> {
    let task = self
      .registry
      .sync_task(tag)
      .ok_or_else(|| eyre!("Unknown sync tag: {}", tag))?;

    let pending = self.outbox.list_pending(task.store)?;
    let mut delivered = 0;

    for item in pending {
      let response = self.deliver(task, &item).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Delivery of {} item {} failed with status {}",
          task.store.as_str(),
          item.id,
          response.status
        ));
      }
      self.outbox.remove(task.store, item.id)?;
      delivered += 1;
    }

    if delivered > 0 {
      debug!(tag, delivered, "sync drain complete");
    }

    Ok(delivered)
  }

  async fn deliver(&self, task: &SyncTask, item: &OutboxItem) -> Result<FetchResponse> {
    let url = self
      .registry
      .origin
      .join(&task.endpoint)
      .map_err(|e| eyre!("Invalid sync endpoint {}: {}", task.endpoint, e))?;
    let request = FetchRequest::post_json(url, &item.payload)?;
    self.network.fetch(&request).await
  }
}
