//! Pool worker — advertises itself as idle, runs what it is handed, reports.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::config::FaultPolicy;
use crate::id::TaskId;
use crate::store::TaskStore;
use crate::store::traits::record_quietly;
use crate::worker::task::{Task, TaskAction};

/// Channel through which the dispatcher hands one specific worker a task.
pub(crate) type WorkerHandle = mpsc::Sender<Task>;

/// Shared dependencies for a worker.
#[derive(Clone)]
pub struct WorkerDeps {
    /// The bounded pool this worker publishes its handle into.
    pub(crate) ready_pool: mpsc::Sender<WorkerHandle>,
    pub store: Arc<dyn TaskStore>,
    pub fault_policy: FaultPolicy,
    pub store_timeout: Duration,
}

/// One execution context of the pool.
pub struct Worker {
    index: usize,
    deps: Option<WorkerDeps>,
    quit: Option<oneshot::Sender<()>>,
}

/// What a single run did to the worker.
#[derive(Debug, PartialEq, Eq)]
enum RunOutcome {
    Succeeded,
    Panicked,
    /// The task carried no body; nothing ran and nothing was recorded.
    Skipped,
}

impl Worker {
    /// Create a new worker. Nothing runs until [`Worker::start`].
    pub fn new(index: usize, deps: WorkerDeps) -> Self {
        Self {
            index,
            deps: Some(deps),
            quit: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Spawn the worker loop. The returned handle resolves when the loop exits.
    ///
    /// Returns `None` if the worker was already started.
    pub fn start(&mut self) -> Option<JoinHandle<()>> {
        let deps = self.deps.take()?;
        let (quit_tx, quit_rx) = oneshot::channel();
        self.quit = Some(quit_tx);

        let runner = WorkerLoop {
            index: self.index,
            deps,
        };
        Some(tokio::spawn(runner.run(quit_rx)))
    }

    /// Ask the loop to exit. Does not wait; a task in progress runs to completion first.
    pub fn stop(&mut self) {
        if let Some(quit) = self.quit.take() {
            // Err means the loop already exited on its own.
            let _ = quit.send(());
        }
    }
}

struct WorkerLoop {
    index: usize,
    deps: WorkerDeps,
}

impl WorkerLoop {
    async fn run(self, mut quit: oneshot::Receiver<()>) {
        let (assigned_tx, mut assigned_rx) = mpsc::channel::<Task>(1);
        debug!(worker = self.index, "Worker started");

        loop {
            // Advertise as idle. The pool has one slot per worker, so this only
            // waits under transient contention.
            tokio::select! {
                biased;
                _ = &mut quit => break,
                sent = self.deps.ready_pool.send(assigned_tx.clone()) => {
                    if sent.is_err() {
                        debug!(worker = self.index, "Ready pool closed");
                        break;
                    }
                }
            }

            // A task already handed over wins over a concurrent stop.
            let task = tokio::select! {
                biased;
                task = assigned_rx.recv() => task,
                _ = &mut quit => None,
            };
            let Some(task) = task else { break };

            if self.execute(task).await == RunOutcome::Panicked
                && self.deps.fault_policy == FaultPolicy::Terminate
            {
                warn!(worker = self.index, "Worker terminated by task panic; pool slot lost");
                break;
            }
        }

        if let Err(e) = self.deps.store.release_connection().await {
            warn!(worker = self.index, error = %e, "Failed to release store connection");
        }
        debug!(worker = self.index, "Worker exited");
    }

    async fn execute(&self, mut task: Task) -> RunOutcome {
        let id = task.id().cloned().unwrap_or_else(|| TaskId::new("unassigned"));
        let kind = task.kind();
        let name = task.name().to_string();
        let store = &self.deps.store;

        let timeout = self.deps.store_timeout;

        let Some(action) = task.take_action() else {
            warn!(worker = self.index, task_id = %id, name = %name, "Task has no body; skipping");
            return RunOutcome::Skipped;
        };

        record_quietly(timeout, "enqueued", &id, store.record_enqueued(&id, &name, kind, Utc::now()))
            .await;

        debug!(worker = self.index, task_id = %id, %kind, name = %name, "Running task");
        let started = Instant::now();
        let joined = match action {
            TaskAction::Blocking(run) => tokio::task::spawn_blocking(run).await,
            TaskAction::Async(fut) => tokio::spawn(fut).await,
        };
        let elapsed = started.elapsed();

        match joined {
            Ok(()) => {
                task.finish(elapsed, true);
                debug!(
                    worker = self.index,
                    task_id = %id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task succeeded"
                );
                record_quietly(
                    timeout,
                    "succeeded",
                    &id,
                    store.record_succeeded(&id, kind, elapsed, &name, Utc::now()),
                )
                .await;
                RunOutcome::Succeeded
            }
            Err(e) => {
                let reason = panic_reason(e);
                task.finish(elapsed, false);
                error!(
                    worker = self.index,
                    task_id = %id,
                    name = %name,
                    reason = %reason,
                    "Task panicked"
                );
                record_quietly(
                    timeout,
                    "failed",
                    &id,
                    store.record_failed(&id, kind, elapsed, &name, &reason, Utc::now()),
                )
                .await;
                RunOutcome::Panicked
            }
        }
    }
}

fn panic_reason(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_payload_message(payload.as_ref()),
        Err(e) => e.to_string(),
    }
}

fn panic_payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
