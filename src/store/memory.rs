//! In-memory lifecycle log.
//!
//! Every connection handed out by a [`MemoryStore`] appends to the same shared
//! log, so tests can assert on the global order of events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::id::TaskId;
use crate::store::traits::{StoreConnector, TaskStore};
use crate::worker::TaskKind;

/// A recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Scheduled {
        id: TaskId,
        name: String,
        scheduled_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    },
    Enqueued {
        id: TaskId,
        name: String,
        kind: TaskKind,
        enqueued_at: DateTime<Utc>,
    },
    Succeeded {
        id: TaskId,
        name: String,
        kind: TaskKind,
        duration: Duration,
        succeeded_at: DateTime<Utc>,
    },
    Failed {
        id: TaskId,
        name: String,
        kind: TaskKind,
        duration: Duration,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Scheduled { id, .. }
            | Self::Enqueued { id, .. }
            | Self::Succeeded { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }

    /// Short status label, matching the collection the event lands in.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Scheduled { .. } => "scheduled",
            Self::Enqueued { .. } => "enqueued",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    events: Mutex<Vec<LifecycleEvent>>,
    opened: AtomicUsize,
    released: AtomicUsize,
    failing: AtomicBool,
}

/// Shared in-memory store. Cloning shares the log.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far, in arrival order.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.inner.events.lock().expect("event log poisoned").clone()
    }

    /// Events recorded for a single task, in arrival order.
    pub fn events_for(&self, id: &TaskId) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == id)
            .collect()
    }

    /// Number of connections handed out by [`StoreConnector::connect`].
    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Number of [`TaskStore::release_connection`] calls received.
    pub fn connections_released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail (events are not recorded while set).
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    fn push(&self, event: LifecycleEvent) -> Result<(), DatabaseError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query(format!(
                "injected failure recording {} for {}",
                event.status(),
                event.task_id()
            )));
        }
        self.inner
            .events
            .lock()
            .expect("event log poisoned")
            .push(event);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn record_scheduled(
        &self,
        id: &TaskId,
        name: &str,
        scheduled_at: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.push(LifecycleEvent::Scheduled {
            id: id.clone(),
            name: name.to_string(),
            scheduled_at,
            fire_at,
        })
    }

    async fn record_enqueued(
        &self,
        id: &TaskId,
        name: &str,
        kind: TaskKind,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.push(LifecycleEvent::Enqueued {
            id: id.clone(),
            name: name.to_string(),
            kind,
            enqueued_at,
        })
    }

    async fn record_succeeded(
        &self,
        id: &TaskId,
        kind: TaskKind,
        duration: Duration,
        name: &str,
        succeeded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.push(LifecycleEvent::Succeeded {
            id: id.clone(),
            name: name.to_string(),
            kind,
            duration,
            succeeded_at,
        })
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
        self.push(LifecycleEvent::Failed {
            id: id.clone(),
            name: name.to_string(),
            kind,
            duration,
            reason: reason.to_string(),
            failed_at,
        })
    }

    async fn release_connection(&self) -> Result<(), DatabaseError> {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn TaskStore>, DatabaseError> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connections_share_one_log() {
        let store = MemoryStore::new();
        let a = store.connect().await.unwrap();
        let b = store.connect().await.unwrap();
        let id = TaskId::new("t-1");

        a.record_enqueued(&id, "job", TaskKind::Background, Utc::now())
            .await
            .unwrap();
        b.record_succeeded(&id, TaskKind::Background, Duration::from_millis(3), "job", Utc::now())
            .await
            .unwrap();

        let statuses: Vec<_> = store.events_for(&id).iter().map(|e| e.status()).collect();
        assert_eq!(statuses, vec!["enqueued", "succeeded"]);
        assert_eq!(store.connections_opened(), 2);
    }

    #[tokio::test]
    async fn failing_mode_rejects_writes() {
        let store = MemoryStore::new();
        store.set_failing(true);

        let err = store
            .record_enqueued(&TaskId::new("t-2"), "job", TaskKind::Background, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
        assert!(store.events().is_empty());
    }

    #[test]
    fn events_serialize_with_status_tag() {
        let event = LifecycleEvent::Enqueued {
            id: TaskId::new("t-3"),
            name: "job".to_string(),
            kind: TaskKind::Scheduled,
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "enqueued");
        assert_eq!(json["kind"], "scheduled");
        assert_eq!(json["id"], "t-3");
    }
}
