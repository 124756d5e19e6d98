//! Persistent cache snapshot and its SQLite implementation.
//!
//! The in-memory caches are mirrored here so expired data can still be
//! served after a restart while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::model::EntityKind;
use crate::remote::Document;

/// A snapshot row: the cached document and when it entered the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
  pub document: Document,
  pub cached_at: DateTime<Utc>,
}

/// Trait for snapshot backends. Calls may block.
pub trait CacheSnapshot: Send + Sync {
  /// Store or replace one document.
  fn store(&self, kind: EntityKind, document: &Document, cached_at: DateTime<Utc>) -> Result<()>;

  /// Remove one document.
  fn remove(&self, kind: EntityKind, id: &str) -> Result<()>;

  /// All documents of a kind.
  fn load(&self, kind: EntityKind) -> Result<Vec<SnapshotRow>>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;
}

/// Snapshot that doesn't persist anything.
/// Used when the snapshot is disabled - all operations are no-ops.
pub struct NoopSnapshot;

impl CacheSnapshot for NoopSnapshot {
  fn store(&self, _kind: EntityKind, _document: &Document, _cached_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _kind: EntityKind, _id: &str) -> Result<()> {
    Ok(())
  }

  fn load(&self, _kind: EntityKind) -> Result<Vec<SnapshotRow>> {
    Ok(Vec::new()) // Always empty
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based snapshot.
pub struct SqliteSnapshot {
  conn: Mutex<Connection>,
}

impl SqliteSnapshot {
  /// Open the snapshot at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Snapshot held in memory only; gone when dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let snapshot = Self {
      conn: Mutex::new(conn),
    };
    snapshot.run_migrations()?;
    Ok(snapshot)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stockroom").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_kind, entity_id)
);
"#;

impl CacheSnapshot for SqliteSnapshot {
  fn store(&self, kind: EntityKind, document: &Document, cached_at: DateTime<Utc>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data = serde_json::to_vec(&document.data)
      .map_err(|e| eyre!("Failed to serialize document: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entity_cache (entity_kind, entity_id, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![kind.as_str(), document.id, data, cached_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store document: {}", e))?;

    Ok(())
  }

  fn remove(&self, kind: EntityKind, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM entity_cache WHERE entity_kind = ? AND entity_id = ?",
        params![kind.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to remove document: {}", e))?;

    Ok(())
  }

  fn load(&self, kind: EntityKind) -> Result<Vec<SnapshotRow>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT entity_id, data, cached_at FROM entity_cache
         WHERE entity_kind = ?
         ORDER BY entity_id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw = stmt
      .query_map(params![kind.as_str()], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query documents: {}", e))?;

    // Unreadable rows are skipped, never fatal for the whole kind
    let mut rows = Vec::new();
    for result in raw {
      let (id, data, cached_at) = match result {
        Ok(row) => row,
        Err(e) => {
          warn!(%kind, error = %e, "Skipping unreadable snapshot row");
          continue;
        }
      };
      let value = match serde_json::from_slice(&data) {
        Ok(value) => value,
        Err(e) => {
          warn!(%kind, %id, error = %e, "Skipping snapshot row with unreadable data");
          continue;
        }
      };
      let cached_at = match parse_datetime(&cached_at) {
        Ok(at) => at,
        Err(e) => {
          warn!(%kind, %id, error = %e, "Skipping snapshot row with unreadable timestamp");
          continue;
        }
      };
      rows.push(SnapshotRow {
        document: Document::new(id, value),
        cached_at,
      });
    }

    Ok(rows)
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM entity_cache", [])
      .map_err(|e| eyre!("Failed to clear cache snapshot: {}", e))?;

    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

enum SnapshotOp {
  Store {
    kind: EntityKind,
    document: Document,
    cached_at: DateTime<Utc>,
  },
  Remove {
    kind: EntityKind,
    id: String,
  },
  Clear,
  Flush(oneshot::Sender<()>),
}

/// Applies snapshot changes in order on a blocking worker, off the callers'
/// tasks. Failures are logged; the snapshot is best effort.
#[derive(Clone)]
pub struct SnapshotWriter {
  tx: mpsc::UnboundedSender<SnapshotOp>,
  snapshot: Arc<dyn CacheSnapshot>,
}

impl SnapshotWriter {
  /// Start the worker. Must be called from within a tokio runtime.
  pub fn spawn(snapshot: Arc<dyn CacheSnapshot>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = Arc::clone(&snapshot);

    tokio::task::spawn_blocking(move || {
      while let Some(op) = rx.blocking_recv() {
        apply(worker.as_ref(), op);
      }
      debug!("Snapshot writer stopped");
    });

    Self { tx, snapshot }
  }

  pub fn store(&self, kind: EntityKind, document: Document, cached_at: DateTime<Utc>) {
    self.send(SnapshotOp::Store {
      kind,
      document,
      cached_at,
    });
  }

  pub fn remove(&self, kind: EntityKind, id: impl Into<String>) {
    self.send(SnapshotOp::Remove { kind, id: id.into() });
  }

  pub fn clear(&self) {
    self.send(SnapshotOp::Clear);
  }

  /// Wait until every change queued before this call has been applied.
  pub async fn flush(&self) {
    let (done_tx, done_rx) = oneshot::channel();
    self.send(SnapshotOp::Flush(done_tx));
    let _ = done_rx.await;
  }

  /// Read all rows of a kind on the blocking pool.
  pub async fn load(&self, kind: EntityKind) -> Result<Vec<SnapshotRow>> {
    let snapshot = Arc::clone(&self.snapshot);
    tokio::task::spawn_blocking(move || snapshot.load(kind))
      .await
      .map_err(|e| eyre!("Snapshot load task failed: {}", e))?
  }

  fn send(&self, op: SnapshotOp) {
    if self.tx.send(op).is_err() {
      warn!("Snapshot writer is gone; change dropped");
    }
  }
}

fn apply(snapshot: &dyn CacheSnapshot, op: SnapshotOp) {
  let result = match op {
    SnapshotOp::Store {
      kind,
      document,
      cached_at,
    } => snapshot.store(kind, &document, cached_at),
    SnapshotOp::Remove { kind, id } => snapshot.remove(kind, &id),
    SnapshotOp::Clear => snapshot.clear(),
    SnapshotOp::Flush(done) => {
      let _ = done.send(());
      Ok(())
    }
  };

  if let Err(e) = result {
    warn!(error = %e, "Cache snapshot update failed");
  }
}
