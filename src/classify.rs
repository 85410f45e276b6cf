//! Pure request classification: which partition and strategy serve a request.
//!
//! Classification never touches storage or the network. The separate
//! [`storable`] predicate gates writes inside every strategy, independent of
//! how the request was classified.

use http::Method;

use crate::net::FetchRequest;
use crate::registry::{PartitionKind, Registry};

/// Cache/network precedence for a classified request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve from cache, refresh stale entries in the background
  CacheFirst,
  /// Try the network, fall back to cache or a synthesized offline response
  NetworkFirst,
  /// Serve from cache immediately while revalidating for next time
  StaleWhileRevalidate,
}

/// Outcome of classifying an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Serve through the given partition and strategy.
  Handle {
    partition: PartitionKind,
    strategy: Strategy,
  },
  /// Pass the request through untouched.
  Skip,
}

/// Header that forces a request past the cache layer entirely.
pub const BYPASS_HEADER: &str = "x-shelf-bypass";

const STATIC_EXTENSIONS: &[&str] = &["css", "js", "mjs", "woff", "woff2", "ttf", "otf", "eot"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"];
const API_PREFIXES: &[&str] = &["/api/", "/analytics", "/contact"];

/// Map a request to a partition and strategy. First match wins.
pub fn classify(request: &FetchRequest, registry: &Registry) -> Classification {
  if !matches!(request.url.scheme(), "http" | "https") || request.header(BYPASS_HEADER).is_some() {
    return Classification::Skip;
  }

  if registry.is_shell_asset(&request.url) {
    return handle(PartitionKind::Shell, Strategy::CacheFirst);
  }

  let path = request.url.path();

  if has_extension(path, STATIC_EXTENSIONS)
    || path.starts_with("/assets/")
    || path.starts_with("/fonts/")
  {
    return handle(PartitionKind::Static, Strategy::CacheFirst);
  }

  if has_extension(path, IMAGE_EXTENSIONS) {
    return handle(PartitionKind::Images, Strategy::StaleWhileRevalidate);
  }

  if API_PREFIXES.iter().any(|p| path.starts_with(p)) {
    return handle(PartitionKind::Api, Strategy::NetworkFirst);
  }

  if request.is_navigation() {
    return handle(PartitionKind::Dynamic, Strategy::NetworkFirst);
  }

  handle(PartitionKind::Dynamic, Strategy::StaleWhileRevalidate)
}

fn handle(partition: PartitionKind, strategy: Strategy) -> Classification {
  Classification::Handle {
    partition,
    strategy,
  }
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
  match path.rsplit_once('.') {
    Some((_, ext)) => extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)),
    None => false,
  }
}

/// Whether a successful response for this request may be written to its
/// partition.
pub fn storable(request: &FetchRequest, registry: &Registry) -> bool {
  if request.method != Method::GET {
    return false;
  }

  let path = request.url.path();
  if path.contains("/admin") || path.contains("/debug") {
    return false;
  }

  let no_cache = request
    .url
    .query_pairs()
    .any(|(k, _)| matches!(k.as_ref(), "no-cache" | "nocache" | "cache-bust"));
  if no_cache {
    return false;
  }

  if !registry.same_origin(&request.url) && !registry.allows_origin(&request.url) {
    return false;
  }

  true
}
