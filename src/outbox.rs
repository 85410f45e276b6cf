//! Durable outbox for offline-deferred units of work.
//!
//! Analytics batches and form submissions land here when delivery has to
//! wait for connectivity. Items persist until the sync coordinator confirms
//! a successful delivery and removes them.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// The logical outbox stores, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreName {
  Analytics,
  Forms,
}

impl StoreName {
  pub fn as_str(self) -> &'static str {
    match self {
      StoreName::Analytics => "analytics",
      StoreName::Forms => "forms",
    }
  }

  fn table(self) -> &'static str {
    match self {
      StoreName::Analytics => "outbox_analytics",
      StoreName::Forms => "outbox_forms",
    }
  }
}

/// A pending unit of work awaiting network delivery.
#[derive(Debug, Clone)]
pub struct OutboxItem {
  /// Store-assigned, monotonically increasing
  pub id: i64,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

/// Schema for the outbox tables.
const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_analytics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS outbox_forms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable queue backed by its own SQLite database, kept separate from the
/// cache store so sync drains never contend with request handling.
pub struct Outbox {
  conn: Mutex<Connection>,
}

impl Outbox {
  /// Open (or create) the outbox at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create outbox directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open outbox database at {}: {}", path.display(), e))?;

    let outbox = Self {
      conn: Mutex::new(conn),
    };
    outbox.run_migrations()?;

    Ok(outbox)
  }

  #[cfg(test)]
  pub(crate) fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory outbox database: {}", e))?;
    let outbox = Self {
      conn: Mutex::new(conn),
    };
    outbox.run_migrations()?;
    Ok(outbox)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(OUTBOX_SCHEMA)
      .map_err(|e| eyre!("Failed to run outbox migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Append an item. Returns its id once the row is durably persisted.
  pub fn enqueue(&self, store: StoreName, payload: &Value) -> Result<i64> {
    let serialized =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        &format!("INSERT INTO {} (payload) VALUES (?)", store.table()),
        params![serialized],
      )
      .map_err(|e| eyre!("Failed to enqueue {} item: {}", store.as_str(), e))?;

    Ok(conn.last_insert_rowid())
  }

  /// All pending items for a store, in enqueue order.
  pub fn list_pending(&self, store: StoreName) -> Result<Vec<OutboxItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT id, payload, enqueued_at FROM {} ORDER BY id",
        store.table()
      ))
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let rows: Vec<(i64, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query {} items: {}", store.as_str(), e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(id, payload, enqueued_at)| {
        Ok(OutboxItem {
          id,
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Failed to deserialize payload for item {}: {}", id, e))?,
          enqueued_at: parse_datetime(&enqueued_at)?,
        })
      })
      .collect()
  }

  /// Delete exactly one item by id.
  pub fn remove(&self, store: StoreName, id: i64) -> Result<()> {
    self
      .lock()?
      .execute(
        &format!("DELETE FROM {} WHERE id = ?", store.table()),
        params![id],
      )
      .map_err(|e| eyre!("Failed to remove {} item {}: {}", store.as_str(), id, e))?;
    Ok(())
  }

  pub fn pending_count(&self, store: StoreName) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", store.table()),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {} items: {}", store.as_str(), e))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
