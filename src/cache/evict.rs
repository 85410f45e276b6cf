//! Age- and count-bounded partition pruning.

use chrono::Utc;
use color_eyre::Result;
use tracing::debug;

use super::store::CacheStore;
use crate::registry::Partition;

/// Prune a partition down to its configured bounds. Returns the number of
/// entries removed.
///
/// Idempotent and safe to call repeatedly: both passes operate on a snapshot
/// of keys taken at entry, so entries written concurrently are left alone
/// until the next pass.
pub fn evict(store: &CacheStore, partition: &Partition) -> Result<usize> {
  let snapshot = store.keys_by_age(&partition.name)?; // newest first
  let mut removed = 0;

  // Count bound: keep the max_entries newest, drop the rest.
  if snapshot.len() > partition.max_entries {
    for (key, _) in &snapshot[partition.max_entries..] {
      store.delete(&partition.name, key)?;
      removed += 1;
    }
  }

  // Age bound: unconditional, runs even when the count is within bounds.
  if let Some(max_age) = partition.max_age {
    let now = Utc::now();
    for (key, cached_at) in snapshot.iter().take(partition.max_entries) {
      if now - *cached_at > max_age {
        store.delete(&partition.name, key)?;
        removed += 1;
      }
    }
  }

  if removed > 0 {
    debug!(partition = %partition.name, removed, "evicted cache entries");
  }

  Ok(removed)
}
