//! Queue — the dispatcher that pairs submitted tasks with idle workers.
//!
//! Tasks enter through a rendezvous intake channel. The dispatch loop pulls
//! one idle worker handle from the ready pool per task and hands the task
//! over. Shutdown is two-phase: the dispatch loop stops every worker and
//! joins them, then `stop()` joins the dispatch loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, QueueError};
use crate::id::{IdSource, RandomIdSource, TaskId};
use crate::store::traits::record_quietly;
use crate::store::{LibSqlConnector, StoreConnector, TaskStore};
use crate::worker::scheduler::{self, ScheduledHandle, parse_duration};
use crate::worker::task::{BackgroundTask, ScheduledTask, Task};
use crate::worker::worker::{Worker, WorkerDeps, WorkerHandle};

/// A task on its way to the dispatch loop, plus the acceptance signal.
pub(crate) struct Submission {
    task: Task,
    accepted: oneshot::Sender<()>,
}

/// Sending side of the intake channel.
#[derive(Clone)]
pub(crate) struct Intake {
    tx: mpsc::Sender<Submission>,
}

impl Intake {
    /// Submit a task and wait until the dispatch loop has taken it.
    pub(crate) async fn submit(&self, task: Task) -> Result<(), QueueError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.tx
            .send(Submission {
                task,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| QueueError::Stopped)?;
        // Dropped unacknowledged when the loop exits with the submission still buffered.
        accepted_rx.await.map_err(|_| QueueError::Stopped)
    }

    /// Resolves once the dispatch loop has exited and dropped the intake.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }
}

enum Lifecycle {
    Idle(Box<Dispatcher>),
    Running {
        quit: oneshot::Sender<()>,
        dispatcher: JoinHandle<()>,
    },
    Stopped,
}

/// A bounded worker pool fed by `enqueue` and `schedule`.
pub struct Queue {
    config: QueueConfig,
    ids: Arc<dyn IdSource>,
    /// The queue's own connection, used for "scheduled" events.
    store: Arc<dyn TaskStore>,
    intake: Intake,
    lifecycle: Mutex<Lifecycle>,
}

impl Queue {
    /// Build a queue with `config.pool_size` workers.
    ///
    /// Opens one store connection for the queue and one per worker.
    pub async fn new(
        config: QueueConfig,
        connector: &dyn StoreConnector,
        ids: Arc<dyn IdSource>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store = connector.connect().await?;
        let (intake_tx, intake_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(config.pool_size);

        let mut workers = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            workers.push(Worker::new(
                index,
                WorkerDeps {
                    ready_pool: ready_tx.clone(),
                    store: connector.connect().await?,
                    fault_policy: config.fault_policy,
                    store_timeout: config.store_timeout,
                },
            ));
        }

        let dispatcher = Dispatcher {
            intake: intake_rx,
            ready_pool: ready_rx,
            workers,
        };

        Ok(Self {
            config,
            ids,
            store,
            intake: Intake { tx: intake_tx },
            lifecycle: Mutex::new(Lifecycle::Idle(Box::new(dispatcher))),
        })
    }

    /// Build a queue backed by the libSQL database at `config.db_path`.
    pub async fn open(config: QueueConfig) -> Result<Self, Error> {
        let connector = LibSqlConnector::new_local(&config.db_path).await?;
        Self::new(config, &connector, Arc::new(RandomIdSource)).await
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running { .. })
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("queue lifecycle poisoned")
    }

    /// Start every worker, then the dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut lifecycle = self.lifecycle();
        let mut dispatcher = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(dispatcher) => *dispatcher,
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                return Err(QueueError::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(QueueError::Stopped),
        };

        let workers: Vec<JoinHandle<()>> = dispatcher
            .workers
            .iter_mut()
            .filter_map(Worker::start)
            .collect();

        let (quit_tx, quit_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatcher.run(quit_rx, workers));
        *lifecycle = Lifecycle::Running {
            quit: quit_tx,
            dispatcher: handle,
        };

        info!(
            pool_size = self.config.pool_size,
            fault_policy = %self.config.fault_policy,
            "Queue started"
        );
        Ok(())
    }

    /// Stop the dispatch loop and every worker, waiting for all of them.
    ///
    /// Tasks already running are allowed to finish; a task that never
    /// returns keeps this call waiting forever.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let (quit, dispatcher) = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { quit, dispatcher } => (quit, dispatcher),
                idle @ Lifecycle::Idle(_) => {
                    *lifecycle = idle;
                    return Err(QueueError::NotStarted);
                }
                Lifecycle::Stopped => return Err(QueueError::Stopped),
            }
        };

        info!("Queue stopping");
        // Err means the dispatch loop already ended; the join below reports why.
        let _ = quit.send(());
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }

        if let Err(e) = self.store.release_connection().await {
            warn!(error = %e, "Failed to release queue store connection");
        }
        info!("Queue stopped");
        Ok(())
    }

    /// Submit a task for immediate dispatch.
    ///
    /// Returns once the dispatcher has accepted the task, not once it has run.
    pub async fn enqueue(&self, task: BackgroundTask) -> Result<TaskId, QueueError> {
        self.ensure_running()?;

        let id = self.ids.next_id();
        let task = task.into_submission(id.clone());
        debug!(task_id = %id, name = %task.name(), "Enqueueing task");

        self.intake.submit(task).await?;
        Ok(id)
    }

    /// Submit a task to run after `delay`, written like `"300ms"` or `"1h30m"`.
    ///
    /// Returns as soon as the timer is armed. Use [`ScheduledHandle::fired`]
    /// to wait for the hand-off to the dispatcher.
    pub async fn schedule(&self, task: ScheduledTask, delay: &str) -> Result<ScheduledHandle, Error> {
        let delay = parse_duration(delay)?;
        Ok(self.schedule_after(task, delay).await?)
    }

    /// Like [`Queue::schedule`] with an already-parsed delay.
    pub async fn schedule_after(
        &self,
        mut task: ScheduledTask,
        delay: Duration,
    ) -> Result<ScheduledHandle, QueueError> {
        self.ensure_running()?;

        task.set_delay(delay);
        let id = self.ids.next_id();
        let (task, delay) = task.into_submission(id.clone());

        let scheduled_at = Utc::now();
        let fire_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| scheduled_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        record_quietly(
            self.config.store_timeout,
            "scheduled",
            &id,
            self.store
                .record_scheduled(&id, task.name(), scheduled_at, fire_at),
        )
        .await;

        debug!(task_id = %id, name = %task.name(), ?delay, "Scheduling task");
        Ok(scheduler::arm(self.intake.clone(), task, id, delay, fire_at))
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        match *self.lifecycle() {
            Lifecycle::Running { .. } => Ok(()),
            Lifecycle::Idle(_) => Err(QueueError::NotStarted),
            Lifecycle::Stopped => Err(QueueError::Stopped),
        }
    }
}

/// State owned by the dispatch loop once started.
struct Dispatcher {
    intake: mpsc::Receiver<Submission>,
    ready_pool: mpsc::Receiver<WorkerHandle>,
    workers: Vec<Worker>,
}

impl Dispatcher {
    async fn run(mut self, mut quit: oneshot::Receiver<()>, workers: Vec<JoinHandle<()>>) {
        loop {
            tokio::select! {
                biased;
                _ = &mut quit => break,
                submission = self.intake.recv() => {
                    let Some(Submission { task, accepted }) = submission else {
                        debug!("Intake closed");
                        break;
                    };
                    let _ = accepted.send(());
                    self.hand_off(task).await;
                }
            }
        }

        for worker in &mut self.workers {
            worker.stop();
        }
        for (index, joined) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!(worker = index, error = %e, "Worker task failed");
            }
        }
        debug!("Dispatcher exited");
    }

    /// Give `task` to the next idle worker, waiting for one if none is idle.
    ///
    /// A published handle is only dropped by its worker after the worker has
    /// been told to quit, which happens once this loop is done dispatching.
    async fn hand_off(&mut self, task: Task) {
        let task_id = task.id().cloned();
        let Some(handle) = self.ready_pool.recv().await else {
            error!(
                task_id = ?task_id,
                "No workers left in the pool; dropping task"
            );
            return;
        };

        if handle.send(task).await.is_err() {
            error!(task_id = ?task_id, "Worker exited before taking its task; dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn test_queue(pool_size: usize) -> (Queue, MemoryStore) {
        let store = MemoryStore::new();
        let config = QueueConfig {
            pool_size,
            ..Default::default()
        };
        let queue = Queue::new(config, &store, Arc::new(RandomIdSource))
            .await
            .unwrap();
        (queue, store)
    }

    #[tokio::test]
    async fn opens_one_connection_per_context() {
        let (queue, store) = test_queue(3).await;
        assert_eq!(store.connections_opened(), 4);
        assert_eq!(queue.pool_size(), 3);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn rejects_zero_pool_size() {
        let store = MemoryStore::new();
        let config = QueueConfig {
            pool_size: 0,
            ..Default::default()
        };
        let result = Queue::new(config, &store, Arc::new(RandomIdSource)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (queue, store) = test_queue(2).await;

        assert_eq!(queue.stop().await, Err(QueueError::NotStarted));
        let early = queue
            .enqueue(BackgroundTask::new("early", Task::new(|| {})))
            .await;
        assert_eq!(early, Err(QueueError::NotStarted));

        queue.start().unwrap();
        assert!(queue.is_running());
        assert_eq!(queue.start(), Err(QueueError::AlreadyStarted));

        queue.stop().await.unwrap();
        assert!(!queue.is_running());
        assert_eq!(queue.stop().await, Err(QueueError::Stopped));
        assert_eq!(queue.start(), Err(QueueError::Stopped));

        // Both workers and the queue released their connections.
        assert_eq!(store.connections_released(), 3);
    }

    #[tokio::test]
    async fn enqueue_returns_distinct_ids() {
        let (queue, _store) = test_queue(2).await;
        queue.start().unwrap();

        let a = queue
            .enqueue(BackgroundTask::new("a", Task::new(|| {})))
            .await
            .unwrap();
        let b = queue
            .enqueue(BackgroundTask::new("b", Task::new(|| {})))
            .await
            .unwrap();
        assert_ne!(a, b);

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_delay_is_rejected_before_anything_is_recorded() {
        let (queue, store) = test_queue(1).await;
        queue.start().unwrap();

        let result = queue
            .schedule(ScheduledTask::new("bad", Task::new(|| {})), "soon")
            .await;
        match result {
            Err(Error::InvalidDuration(e)) => assert_eq!(e.input, "soon"),
            other => panic!("expected InvalidDuration, got {other:?}"),
        }
        assert!(store.events().is_empty());

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pending_timer_is_released_when_queue_stops() {
        let (queue, store) = test_queue(1).await;
        queue.start().unwrap();

        let handle = queue
            .schedule(ScheduledTask::new("late", Task::new(|| {})), "1h")
            .await
            .unwrap();
        queue.stop().await.unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), handle.fired())
            .await
            .expect("timer should not outlive the queue");
        assert_eq!(fired, Err(QueueError::Stopped));

        let statuses: Vec<_> = store.events().iter().map(|e| e.status()).collect();
        assert_eq!(statuses, vec!["scheduled"]);
    }
}
