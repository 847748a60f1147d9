//! `TaskStore` trait — the lifecycle-event sink each execution context talks to.
//!
//! The queue and every worker hold their own connection, handed out by a
//! [`StoreConnector`]. Calls are side effects: the queue logs failures and
//! carries on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::DatabaseError;
use crate::id::TaskId;
use crate::worker::TaskKind;

/// Recorder for task lifecycle transitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// A delayed task was accepted and will fire at `fire_at`.
    async fn record_scheduled(
        &self,
        id: &TaskId,
        name: &str,
        scheduled_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// A worker picked the task up.
    async fn record_enqueued(
        &self,
        id: &TaskId,
        name: &str,
        kind: TaskKind,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// The task ran to completion.
    ///
    /// Removes the enqueued record, and the scheduled record for `Scheduled` tasks.
    async fn record_succeeded(
        &self,
        id: &TaskId,
        kind: TaskKind,
        duration: Duration,
        name: &str,
        succeeded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// The task panicked. Same cleanup as [`TaskStore::record_succeeded`].
    async fn record_failed(
        &self,
        id: &TaskId,
        kind: TaskKind,
        duration: Duration,
        name: &str,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Drop the underlying connection. Called once, at shutdown.
    async fn release_connection(&self) -> Result<(), DatabaseError>;
}

/// Hands out one independent store connection per execution context.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TaskStore>, DatabaseError>;
}

/// Await a store call bounded by `timeout`. Errors and timeouts are logged, never returned.
pub(crate) async fn record_quietly<F>(timeout: Duration, event: &str, id: &TaskId, call: F)
where
    F: Future<Output = Result<(), DatabaseError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(task_id = %id, event, error = %e, "Failed to persist lifecycle event");
        }
        Err(_) => {
            warn!(task_id = %id, event, ?timeout, "Timed out persisting lifecycle event");
        }
    }
}
