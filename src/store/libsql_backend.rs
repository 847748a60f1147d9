//! libSQL backend — one table per lifecycle collection.
//!
//! [`LibSqlConnector`] owns the database handle and runs migrations once;
//! every [`StoreConnector::connect`] opens a fresh libSQL connection wrapped in
//! a [`LibSqlStore`], so no connection is shared between execution contexts.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::id::TaskId;
use crate::store::migrations;
use crate::store::traits::{StoreConnector, TaskStore};
use crate::worker::TaskKind;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// The lifecycle tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Scheduled,
    Enqueued,
    Succeeded,
    Failed,
}

impl Collection {
    fn table(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Enqueued => "enqueued",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// A row of the `succeeded` table.
#[derive(Debug, Clone, Serialize)]
pub struct SucceededRecord {
    pub task_id: TaskId,
    pub task_name: String,
    pub task_type: TaskKind,
    pub duration: Duration,
    pub succeeded_at: DateTime<Utc>,
}

/// Opens libSQL connections against one local database file.
pub struct LibSqlConnector {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlConnector {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let connector = Self { db: Arc::new(db) };
        let conn = connector.open_connection().await?;
        // WAL lets readers proceed while a worker holds the write lock.
        let _ = conn.query("PRAGMA journal_mode = WAL", ()).await;
        migrations::run_migrations(&conn).await?;

        info!(path = %path.display(), "Database opened");
        Ok(connector)
    }

    /// Open a store connection with its concrete type, for inspection queries.
    pub async fn connect_store(&self) -> Result<LibSqlStore, DatabaseError> {
        Ok(LibSqlStore::new(self.open_connection().await?))
    }

    async fn open_connection(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        Ok(conn)
    }
}

#[async_trait]
impl StoreConnector for LibSqlConnector {
    async fn connect(&self) -> Result<Arc<dyn TaskStore>, DatabaseError> {
        Ok(Arc::new(self.connect_store().await?))
    }
}

/// A single libSQL connection used by one execution context.
pub struct LibSqlStore {
    conn: Mutex<Option<Connection>>,
}

impl LibSqlStore {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Clone the connection handle out of the slot, or fail once released.
    fn conn(&self) -> Result<Connection, DatabaseError> {
        self.conn
            .lock()
            .expect("connection slot poisoned")
            .clone()
            .ok_or(DatabaseError::Released)
    }

    /// Number of rows currently in a collection.
    pub async fn count(&self, collection: Collection) -> Result<u64, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(&format!("SELECT COUNT(*) FROM {}", collection.table()), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count {}: {e}", collection.table())))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count {}: {e}", collection.table()))),
        }
    }

    /// All succeeded tasks, oldest first.
    pub async fn succeeded(&self) -> Result<Vec<SucceededRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                "SELECT task_id, task_name, task_type, task_duration_ns, task_succeeded_time
                 FROM succeeded ORDER BY task_succeeded_time ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("succeeded: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("succeeded: {e}")))?
        {
            records.push(
                row_to_succeeded(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(records)
    }

    /// Remove the enqueued row and, for scheduled tasks, the scheduled row.
    async fn clear_pending(
        tx: &Connection,
        id: &TaskId,
        kind: TaskKind,
    ) -> Result<(), DatabaseError> {
        tx.execute("DELETE FROM enqueued WHERE task_id = ?1", params![id.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete enqueued: {e}")))?;

        if kind == TaskKind::Scheduled {
            tx.execute("DELETE FROM scheduled WHERE task_id = ?1", params![id.as_str()])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete scheduled: {e}")))?;
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn row_to_succeeded(row: &libsql::Row) -> Result<SucceededRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let nanos: i64 = row.get(3)?;
    let at: String = row.get(4)?;

    Ok(SucceededRecord {
        task_id: TaskId::new(id),
        task_name: name,
        task_type: kind.parse().unwrap_or(TaskKind::Background),
        duration: Duration::from_nanos(nanos.max(0) as u64),
        succeeded_at: parse_datetime(&at),
    })
}

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn record_scheduled(
        &self,
        id: &TaskId,
        name: &str,
        scheduled_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO scheduled
                    (task_id, task_name, task_status, task_created_time, task_scheduled_time)
                 VALUES (?1, ?2, 'scheduled', ?3, ?4)",
                params![
                    id.as_str(),
                    name,
                    scheduled_at.to_rfc3339(),
                    fire_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_scheduled: {e}")))?;

        debug!(task_id = %id, "Scheduled row inserted");
        Ok(())
    }

    async fn record_enqueued(
        &self,
        id: &TaskId,
        name: &str,
        kind: TaskKind,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO enqueued
                    (task_id, task_name, task_status, task_type, task_enqueued_time)
                 VALUES (?1, ?2, 'enqueued', ?3, ?4)",
                params![id.as_str(), name, kind.to_string(), enqueued_at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_enqueued: {e}")))?;
        Ok(())
    }

    async fn record_succeeded(
        &self,
        id: &TaskId,
        kind: TaskKind,
        duration: Duration,
        name: &str,
        succeeded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        Self::clear_pending(&tx, id, kind).await?;
        tx.execute(
            "INSERT OR REPLACE INTO succeeded
                (task_id, task_name, task_status, task_type, task_duration_ns, task_succeeded_time)
             VALUES (?1, ?2, 'succeeded', ?3, ?4, ?5)",
            params![
                id.as_str(),
                name,
                kind.to_string(),
                duration_to_nanos(duration),
                succeeded_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_succeeded: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))
    }

    async fn record_failed(
        &self,
        id: &TaskId,
        kind: TaskKind,
        duration: Duration,
        name: &str,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        Self::clear_pending(&tx, id, kind).await?;
        tx.execute(
            "INSERT OR REPLACE INTO failed
                (task_id, task_name, task_status, task_type, task_duration_ns, task_reason, task_failed_time)
             VALUES (?1, ?2, 'failed', ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                name,
                kind.to_string(),
                duration_to_nanos(duration),
                reason,
                failed_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))
    }

    async fn release_connection(&self) -> Result<(), DatabaseError> {
        match self.conn.lock().expect("connection slot poisoned").take() {
            Some(_) => Ok(()),
            None => Err(DatabaseError::Released),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_connector(dir: &tempfile::TempDir) -> LibSqlConnector {
        LibSqlConnector::new_local(&dir.path().join("queue.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn succeeded_clears_enqueued_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_connector(&dir).await.connect_store().await.unwrap();
        let id = TaskId::new("bg-1");

        store
            .record_enqueued(&id, "report", TaskKind::Background, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.count(Collection::Enqueued).await.unwrap(), 1);

        store
            .record_succeeded(&id, TaskKind::Background, Duration::from_millis(12), "report", Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count(Collection::Enqueued).await.unwrap(), 0);
        let succeeded = store.succeeded().await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].task_id, id);
        assert_eq!(succeeded[0].task_type, TaskKind::Background);
        assert_eq!(succeeded[0].duration, Duration::from_millis(12));
    }

    #[tokio::test]
    async fn scheduled_row_removed_only_for_scheduled_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_connector(&dir).await.connect_store().await.unwrap();
        let now = Utc::now();
        let delayed = TaskId::new("sc-1");
        let immediate = TaskId::new("bg-2");

        store.record_scheduled(&delayed, "later", now, now).await.unwrap();
        // A background success with a colliding id must not touch `scheduled`.
        store.record_scheduled(&immediate, "decoy", now, now).await.unwrap();

        for (id, kind) in [(&delayed, TaskKind::Scheduled), (&immediate, TaskKind::Background)] {
            store.record_enqueued(id, "x", kind, now).await.unwrap();
            store
                .record_succeeded(id, kind, Duration::ZERO, "x", now)
                .await
                .unwrap();
        }

        assert_eq!(store.count(Collection::Scheduled).await.unwrap(), 1);
        assert_eq!(store.count(Collection::Enqueued).await.unwrap(), 0);
        assert_eq!(store.count(Collection::Succeeded).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_lands_in_failed_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_connector(&dir).await.connect_store().await.unwrap();
        let id = TaskId::new("bg-3");

        store
            .record_enqueued(&id, "boom", TaskKind::Background, Utc::now())
            .await
            .unwrap();
        store
            .record_failed(&id, TaskKind::Background, Duration::from_millis(1), "boom", "panicked", Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count(Collection::Enqueued).await.unwrap(), 0);
        assert_eq!(store.count(Collection::Failed).await.unwrap(), 1);
        assert_eq!(store.count(Collection::Succeeded).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connections_see_each_others_writes() {
        let dir = tempfile::tempdir().unwrap();
        let connector = test_connector(&dir).await;
        let writer = connector.connect().await.unwrap();
        let reader = connector.connect_store().await.unwrap();

        writer
            .record_enqueued(&TaskId::new("bg-4"), "shared", TaskKind::Background, Utc::now())
            .await
            .unwrap();

        assert_eq!(reader.count(Collection::Enqueued).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn released_connection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_connector(&dir).await.connect_store().await.unwrap();

        store.release_connection().await.unwrap();

        let err = store
            .record_enqueued(&TaskId::new("bg-5"), "late", TaskKind::Background, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Released));
        assert!(matches!(
            store.release_connection().await,
            Err(DatabaseError::Released)
        ));
    }

    #[tokio::test]
    async fn reopening_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = test_connector(&dir).await.connect_store().await.unwrap();
            store
                .record_enqueued(&TaskId::new("bg-6"), "persist", TaskKind::Background, Utc::now())
                .await
                .unwrap();
        }

        let store = test_connector(&dir).await.connect_store().await.unwrap();
        assert_eq!(store.count(Collection::Enqueued).await.unwrap(), 1);
    }
}
