//! SQLite-backed partitioned response store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use http::StatusCode;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::FetchResponse;

/// A stored response snapshot plus its capture time.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: FetchResponse,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Age of the entry relative to now.
  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.cached_at
  }
}

/// Schema for the partitioned entry store.
const CACHE_SCHEMA: &str = r#"
-- Known partitions; rows survive even while a partition is empty
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, one row per (partition, request key)
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition_age
    ON entries(partition, cached_at);
"#;

/// Partitioned cache storage over a single SQLite database.
pub struct CacheStore {
  conn: Mutex<Connection>,
}

impl CacheStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  #[cfg(test)]
  pub(crate) fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Record a partition name so it shows up in listings even while empty.
  pub fn register_partition(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to register partition {}: {}", name, e))?;
    Ok(())
  }

  /// All known partition names: registered ones plus any with entries.
  pub fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM partitions
         UNION SELECT DISTINCT partition FROM entries
         ORDER BY 1",
      )
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  /// Drop a partition and every entry in it.
  pub fn drop_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to clear partition {}: {}", name, e))?;
    conn
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to drop partition {}: {}", name, e))?;
    Ok(())
  }

  /// Insert or overwrite an entry. Storing the same response twice is
  /// harmless; the key stays unique within its partition.
  pub fn put(
    &self,
    partition: &str,
    key: &str,
    url: &str,
    response: &FetchResponse,
  ) -> Result<()> {
    self.put_at(partition, key, url, response, Utc::now())
  }

  /// Insert with an explicit capture time. Eviction tests backdate entries
  /// through this.
  pub(crate) fn put_at(
    &self,
    partition: &str,
    key: &str,
    url: &str,
    response: &FetchResponse,
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to register partition {}: {}", partition, e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO entries (partition, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          partition,
          key,
          url,
          response.status.as_u16(),
          headers,
          response.body,
          cached_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        ],
      )
      .map_err(|e| eyre!("Failed to store entry for {}: {}", url, e))?;

    Ok(())
  }

  pub fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE partition = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![partition, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, cached_at)) => {
        let status =
          StatusCode::from_u16(status).map_err(|e| eyre!("Invalid stored status: {}", e))?;
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: FetchResponse {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  pub fn delete(&self, partition: &str, key: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "DELETE FROM entries WHERE partition = ? AND request_key = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;
    Ok(())
  }

  pub fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  /// Snapshot of (key, cached_at) pairs, newest first. Eviction operates on
  /// this snapshot; entries written afterwards are not considered.
  pub fn keys_by_age(&self, partition: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT request_key, cached_at FROM entries
         WHERE partition = ?
         ORDER BY cached_at DESC, request_key",
      )
      .map_err(|e| eyre!("Failed to prepare key snapshot: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![partition], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to snapshot keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(key, cached_at)| Ok((key, parse_datetime(&cached_at)?)))
      .collect()
  }
}

/// Parse a stored datetime, with or without a fractional-second part.
///
/// Sub-second precision keeps `keys_by_age` ordering faithful to write order;
/// rows written before fractions were stored still parse.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
    .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(body: &[u8]) -> FetchResponse {
    FetchResponse {
      status: StatusCode::OK,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.to_vec(),
    }
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = CacheStore::open_in_memory().unwrap();
    store
      .put("shelf-static-v1", "key1", "https://app.example/a.css", &response(b"body { }"))
      .unwrap();

    let cached = store.get("shelf-static-v1", "key1").unwrap().unwrap();
    assert_eq!(cached.response.status, StatusCode::OK);
    assert_eq!(cached.response.header("content-type"), Some("text/html"));
    assert_eq!(cached.response.body, b"body { }");
    assert!(cached.age() < chrono::Duration::minutes(1));
  }

  #[test]
  fn test_overwrite_keeps_single_entry() {
    let store = CacheStore::open_in_memory().unwrap();
    store
      .put("p", "key1", "https://app.example/a", &response(b"first"))
      .unwrap();
    store
      .put("p", "key1", "https://app.example/a", &response(b"second"))
      .unwrap();

    assert_eq!(store.count("p").unwrap(), 1);
    let cached = store.get("p", "key1").unwrap().unwrap();
    assert_eq!(cached.response.body, b"second");
  }

  #[test]
  fn test_partition_names_include_registered_and_written() {
    let store = CacheStore::open_in_memory().unwrap();
    store.register_partition("shelf-api-v1").unwrap();
    store
      .put("shelf-images-v1", "k", "https://app.example/x.png", &response(b"png"))
      .unwrap();

    let names = store.partition_names().unwrap();
    assert_eq!(names, vec!["shelf-api-v1", "shelf-images-v1"]);
  }

  #[test]
  fn test_drop_partition_removes_entries() {
    let store = CacheStore::open_in_memory().unwrap();
    store
      .put("old", "k1", "https://app.example/1", &response(b"1"))
      .unwrap();
    store
      .put("old", "k2", "https://app.example/2", &response(b"2"))
      .unwrap();

    store.drop_partition("old").unwrap();
    assert_eq!(store.count("old").unwrap(), 0);
    assert!(store.get("old", "k1").unwrap().is_none());
    assert!(store.partition_names().unwrap().is_empty());
  }

  #[test]
  fn test_keys_by_age_newest_first() {
    let store = CacheStore::open_in_memory().unwrap();
    let base = Utc::now();
    for (key, mins_ago) in [("a", 30), ("b", 10), ("c", 20)] {
      store
        .put_at(
          "p",
          key,
          "https://app.example/x",
          &response(b"x"),
          base - chrono::Duration::minutes(mins_ago),
        )
        .unwrap();
    }

    let keys: Vec<String> = store
      .keys_by_age("p")
      .unwrap()
      .into_iter()
      .map(|(k, _)| k)
      .collect();
    assert_eq!(keys, vec!["b", "c", "a"]);
  }

  #[test]
  fn test_same_second_writes_keep_insertion_order() {
    let store = CacheStore::open_in_memory().unwrap();
    // Keys chosen so alphabetical order contradicts write order; only the
    // sub-second timestamp can keep the newer entry first.
    store
      .put("p", "a_old", "https://app.example/1", &response(b"1"))
      .unwrap();
    store
      .put("p", "z_new", "https://app.example/2", &response(b"2"))
      .unwrap();

    let keys: Vec<String> = store
      .keys_by_age("p")
      .unwrap()
      .into_iter()
      .map(|(k, _)| k)
      .collect();
    assert_eq!(keys, vec!["z_new", "a_old"]);
  }

  #[test]
  fn test_parse_datetime_accepts_both_precisions() {
    let whole = parse_datetime("2026-08-29 10:00:00").unwrap();
    let fractional = parse_datetime("2026-08-29 10:00:00.250000").unwrap();
    assert!(fractional > whole);
    assert_eq!(fractional - whole, chrono::Duration::milliseconds(250));
    assert!(parse_datetime("not a datetime").is_err());
  }
}
