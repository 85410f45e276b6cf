//! Request/response models and the network seam.
//!
//! The [`Network`] trait is the single point where the worker touches the
//! wire; the production implementation wraps reqwest, tests swap in a
//! scripted mock.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl FetchRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: Vec::new(),
    }
  }

  pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let body =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    Ok(Self {
      method: Method::POST,
      url,
      headers,
      body,
    })
  }

  /// Header value as a string, if present and valid UTF-8.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  /// Whether this is a top-level page navigation.
  ///
  /// A gateway has no `request.mode`; we go by `Sec-Fetch-Mode: navigate`
  /// and fall back to an HTML-accepting GET.
  pub fn is_navigation(&self) -> bool {
    if self.method != Method::GET {
      return false;
    }
    if let Some(mode) = self.header("sec-fetch-mode") {
      return mode == "navigate";
    }
    self
      .header("accept")
      .map(|a| a.contains("text/html"))
      .unwrap_or(false)
  }
}

/// A response snapshot that can be stored in a partition and replayed.
///
/// Headers are plain string pairs so the snapshot serializes cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
  pub status: StatusCode,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Storage key for a request: SHA256 of the fragmentless URL plus an optional
/// vary dimension, hex-encoded for stable fixed-length keys.
pub fn request_key(url: &Url, vary: Option<&str>) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let input = match vary {
    Some(v) => format!("{}\n{}", normalized, v),
    None => normalized.to_string(),
  };

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// The wire. Everything the worker sends or receives goes through here.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Production network backed by reqwest.
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(FetchResponse {
      status,
      headers,
      body,
    })
  }
}
