//! Partitioned response caching.
//!
//! Three pieces: the SQLite-backed entry store, the strategies that decide
//! cache/network precedence per request, and the eviction pass that keeps
//! every partition inside its count and age bounds.

pub mod evict;
pub mod store;
pub mod strategy;
