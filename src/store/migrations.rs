//! Version-tracked migrations for the libSQL backend.
//!
//! `run_migrations()` reads the highest applied version from `_migrations`
//! and applies the newer entries of [`MIGRATIONS`] in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "lifecycle_collections",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled (
                task_id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                task_status TEXT NOT NULL DEFAULT 'scheduled',
                task_created_time TEXT NOT NULL,
                task_scheduled_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS enqueued (
                task_id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                task_status TEXT NOT NULL DEFAULT 'enqueued',
                task_type TEXT NOT NULL,
                task_enqueued_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS succeeded (
                task_id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                task_status TEXT NOT NULL DEFAULT 'succeeded',
                task_type TEXT NOT NULL,
                task_duration_ns INTEGER NOT NULL,
                task_succeeded_time TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_succeeded_time ON succeeded(task_succeeded_time);
        "#,
    },
    Migration {
        version: 2,
        name: "failed_collection",
        sql: r#"
            CREATE TABLE IF NOT EXISTS failed (
                task_id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                task_status TEXT NOT NULL DEFAULT 'failed',
                task_type TEXT NOT NULL,
                task_duration_ns INTEGER NOT NULL,
                task_reason TEXT NOT NULL,
                task_failed_time TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Failed to record migration V{}: {e}",
                    migration.version
                ))
            })?;
        }
    }

    tracing::debug!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}
