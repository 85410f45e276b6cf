//! Detached background tasks.

use color_eyre::Result;
use std::future::Future;
use tracing::warn;

/// Spawn a fire-and-forget task.
///
/// Failures are routed to the log and never rejoin the caller's response
/// path; a refresh that never resolves simply never updates the cache.
pub fn spawn_detached<F>(label: &'static str, task: F)
where
  F: Future<Output = Result<()>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(err) = task.await {
      warn!("{label} failed: {err:#}");
    }
  });
}
