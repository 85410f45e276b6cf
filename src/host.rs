//! HTTP host adapter: binds the worker to a listening socket.
//!
//! Every inbound request funnels through [`Worker::handle_fetch`]; control
//! endpoints under `/_shelf/` expose the message channel, status, and push
//! delivery. Two background loops run alongside the server: periodic cache
//! cleanup and the outbox sync scheduler.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::net::{FetchRequest, FetchResponse, HttpNetwork, Network};
use crate::registry::SyncTask;
use crate::worker::{FetchOutcome, Message, Worker};

/// Request body cap for intercepted and control-channel requests.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// How often the sync scheduler polls the outbox stores.
const SYNC_POLL_SECS: u64 = 30;

pub type SharedWorker = Arc<Worker<HttpNetwork>>;

/// Serve the worker until the process is stopped.
pub async fn serve(
  worker: SharedWorker,
  listen: SocketAddr,
  cleanup_interval: Duration,
) -> Result<()> {
  spawn_maintenance(Arc::clone(&worker), cleanup_interval);
  spawn_sync_scheduler(Arc::clone(&worker));

  let app = router(worker);

  let listener = TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, "listening");

  axum::serve(listener, app)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

fn router<N: Network + 'static>(worker: Arc<Worker<N>>) -> Router {
  Router::new()
    .route("/_shelf/status", get(status))
    .route("/_shelf/message", post(message))
    .route("/_shelf/push", post(push))
    .fallback(intercept)
    .with_state(worker)
}

async fn status<N: Network + 'static>(State(worker): State<Arc<Worker<N>>>) -> Response<Body> {
  match worker.status() {
    Ok(status) => Json(status).into_response(),
    Err(err) => {
      error!("status query failed: {err:#}");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}

async fn message<N: Network + 'static>(
  State(worker): State<Arc<Worker<N>>>,
  Json(message): Json<Message>,
) -> Response<Body> {
  match worker.handle_message(message).await {
    Ok(Some(reply)) => Json(reply).into_response(),
    Ok(None) => StatusCode::ACCEPTED.into_response(),
    Err(err) => {
      error!("message handling failed: {err:#}");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}

/// Push delivery: map the raw payload to the notification to display.
async fn push<N: Network + 'static>(
  State(worker): State<Arc<Worker<N>>>,
  body: Bytes,
) -> Response<Body> {
  Json(worker.handle_push(&body)).into_response()
}

/// The fetch interception path: convert, classify, resolve, replay.
async fn intercept<N: Network + 'static>(
  State(worker): State<Arc<Worker<N>>>,
  request: Request<Body>,
) -> Response<Body> {
  let fetch = match to_fetch_request(request, worker.registry().origin.clone()).await {
    Ok(fetch) => fetch,
    Err(err) => {
      warn!("rejected inbound request: {err:#}");
      return StatusCode::BAD_REQUEST.into_response();
    }
  };

  let result = match worker.handle_fetch(&fetch).await {
    Ok(FetchOutcome::Response(response)) => Ok(response),
    Ok(FetchOutcome::Skip) => {
      debug!(url = %fetch.url, "passing request through uncached");
      worker.forward(&fetch).await
    }
    Err(err) => Err(err),
  };

  match result {
    Ok(response) => to_axum_response(response),
    Err(err) => {
      error!(url = %fetch.url, "fetch failed: {err:#}");
      StatusCode::BAD_GATEWAY.into_response()
    }
  }
}

/// Convert an inbound hyper request into the worker's request model.
///
/// Absolute-form URIs (proxy style) are taken as-is; origin-form paths are
/// resolved against the configured upstream origin.
async fn to_fetch_request(request: Request<Body>, origin: Url) -> Result<FetchRequest> {
  let (parts, body) = request.into_parts();

  let url = if parts.uri.scheme().is_some() {
    Url::parse(&parts.uri.to_string()).map_err(|e| eyre!("Invalid request URI: {}", e))?
  } else {
    let path_and_query = parts
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    origin
      .join(path_and_query)
      .map_err(|e| eyre!("Cannot resolve {} against upstream: {}", path_and_query, e))?
  };

  let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?;

  Ok(FetchRequest {
    method: parts.method,
    url,
    headers: parts.headers,
    body: body.to_vec(),
  })
}

/// Replay a stored or fetched response to the client.
///
/// Hop-by-hop headers are dropped; the body is served from the snapshot, so
/// the original transfer framing no longer applies.
fn to_axum_response(response: FetchResponse) -> Response<Body> {
  let mut builder = Response::builder().status(response.status);
  for (name, value) in &response.headers {
    if matches!(
      name.to_ascii_lowercase().as_str(),
      "transfer-encoding" | "connection" | "content-length"
    ) {
      continue;
    }
    builder = builder.header(name, value);
  }
  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Periodic eviction across all partitions.
fn spawn_maintenance(worker: SharedWorker, interval: Duration) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      match worker.cleanup() {
        Ok(removed) if removed > 0 => info!(removed, "cache-cleanup pass finished"),
        Ok(_) => debug!("cache-cleanup pass finished, nothing to remove"),
        Err(err) => warn!("cache-cleanup failed: {err:#}"),
      }
    }
  });
}

/// Poll the outbox stores and drain them when items are waiting.
fn spawn_sync_scheduler(worker: SharedWorker) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_POLL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      let tasks: Vec<SyncTask> = worker.registry().sync_tasks.clone();
      for task in tasks {
        let pending = match worker.pending(task.store) {
          Ok(count) => count,
          Err(err) => {
            warn!(tag = task.tag.as_str(), "pending check failed: {err:#}");
            continue;
          }
        };
        if pending == 0 {
          continue;
        }
        run_with_retry(&worker, &task).await;
      }
    }
  });
}

/// One scheduled sync run, retried within the task descriptor's bounds.
/// Returns whether the run delivered; an exhausted window is escalated to the
/// log since items stay queued and the next poll will try again.
async fn run_with_retry<N: Network + 'static>(worker: &Worker<N>, task: &SyncTask) -> bool {
  for attempt in 1..=task.max_retries {
    match worker.handle_sync(&task.tag).await {
      Ok(delivered) => {
        if delivered > 0 {
          info!(tag = task.tag.as_str(), delivered, "sync run delivered items");
        }
        return true;
      }
      Err(err) => {
        warn!(
          tag = task.tag.as_str(),
          attempt,
          max = task.max_retries,
          "sync run failed: {err:#}"
        );
        if attempt < task.max_retries {
          tokio::time::sleep(task.retry_delay).await;
        }
      }
    }
  }
  let queued = worker.pending(task.store).unwrap_or(0);
  error!(
    tag = task.tag.as_str(),
    queued, "sync retries exhausted; items remain queued until the endpoint recovers"
  );
  false
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::CacheStore;
  use crate::net::mock::MockNetwork;
  use crate::outbox::{Outbox, StoreName};
  use crate::registry::test_registry;
  use serde_json::json;

  fn worker() -> Arc<Worker<MockNetwork>> {
    Arc::new(Worker::new(
      test_registry("v1"),
      CacheStore::open_in_memory().unwrap(),
      Outbox::open_in_memory().unwrap(),
      MockNetwork::new(),
    ))
  }

  async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
      .await
      .unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn test_push_route_returns_notification() {
    let worker = worker();
    let payload = Bytes::from_static(br#"{"body": "Sale ends tonight", "url": "/offers"}"#);

    let response = push(State(worker), payload).await;

    assert_eq!(response.status(), StatusCode::OK);
    let notification = body_json(response).await;
    assert_eq!(notification["title"], "Shelf");
    assert_eq!(notification["body"], "Sale ends tonight");
    assert_eq!(notification["url"], "/offers");
    assert_eq!(notification["vibrate"], json!([100, 50, 100]));
  }

  #[tokio::test]
  async fn test_push_route_defaults_on_malformed_payload() {
    let worker = worker();
    let response = push(State(worker), Bytes::from_static(b"not json")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let notification = body_json(response).await;
    assert_eq!(notification["url"], "/");
  }

  #[tokio::test]
  async fn test_sync_retry_stops_at_descriptor_bound() {
    let worker = worker();
    worker
      .handle_message(Message::CacheAnalytics {
        payload: json!({"event": "pageview"}),
      })
      .await
      .unwrap();

    // Endpoint never recovers; the attempt count must not exceed the bound.
    let task = SyncTask {
      tag: "analytics-sync".to_string(),
      store: StoreName::Analytics,
      endpoint: "/api/analytics".to_string(),
      max_retries: 3,
      retry_delay: Duration::ZERO,
    };
    worker.network().set_offline(true);

    let delivered = run_with_retry(&worker, &task).await;

    assert!(!delivered);
    assert_eq!(worker.network().call_count(), 3);
    assert_eq!(worker.pending(StoreName::Analytics).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_retry_returns_after_first_success() {
    let worker = worker();
    worker
      .handle_message(Message::CacheAnalytics {
        payload: json!({"event": "pageview"}),
      })
      .await
      .unwrap();
    worker
      .network()
      .route("https://app.example/api/analytics", 200, b"ok");

    let task = SyncTask {
      tag: "analytics-sync".to_string(),
      store: StoreName::Analytics,
      endpoint: "/api/analytics".to_string(),
      max_retries: 3,
      retry_delay: Duration::ZERO,
    };

    let delivered = run_with_retry(&worker, &task).await;

    assert!(delivered);
    assert_eq!(worker.network().call_count(), 1);
    assert_eq!(worker.pending(StoreName::Analytics).unwrap(), 0);
  }
}
