//! Task types: the unit of work and the caller-facing wrappers around it.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// How a task entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Submitted through `enqueue`, dispatched immediately.
    Background,
    /// Submitted through `schedule`, dispatched after a delay.
    Scheduled,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Background => "background",
            Self::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "background" => Ok(Self::Background),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown task kind '{other}'")),
        }
    }
}

/// The executable body of a task. Consumed by its single invocation.
pub enum TaskAction {
    /// Synchronous closure, run on the blocking thread pool.
    Blocking(Box<dyn FnOnce() + Send + 'static>),
    /// Future, run as its own tokio task.
    Async(BoxFuture<'static, ()>),
}

impl fmt::Debug for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("TaskAction::Blocking"),
            Self::Async(_) => f.write_str("TaskAction::Async"),
        }
    }
}

/// Runtime metadata attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    pub name: String,
    /// `None` until the task has been submitted.
    pub kind: Option<TaskKind>,
    /// Wall time of the run, written after execution.
    pub duration: Option<Duration>,
    /// Written after execution.
    pub success: bool,
}

/// A unit of work plus its identity.
///
/// Identity, name, and kind are stamped exactly once, when a
/// [`BackgroundTask`] or [`ScheduledTask`] is handed to the queue.
#[derive(Debug)]
pub struct Task {
    id: Option<TaskId>,
    action: Option<TaskAction>,
    metadata: TaskMetadata,
}

impl Task {
    /// Task whose body is a blocking closure.
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_action(TaskAction::Blocking(Box::new(run)))
    }

    /// Task whose body is a future.
    pub fn from_future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_action(TaskAction::Async(Box::pin(fut)))
    }

    fn from_action(action: TaskAction) -> Self {
        Self {
            id: None,
            action: Some(action),
            metadata: TaskMetadata::default(),
        }
    }

    /// Identifier, present once the task has been submitted.
    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    pub fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Kind, falling back to `Background` for a task that was never stamped.
    pub(crate) fn kind(&self) -> TaskKind {
        self.metadata.kind.unwrap_or(TaskKind::Background)
    }

    pub(crate) fn stamp(&mut self, id: TaskId, name: String, kind: TaskKind) {
        debug_assert!(self.id.is_none(), "task metadata stamped twice");
        self.id = Some(id);
        self.metadata.name = name;
        self.metadata.kind = Some(kind);
    }

    /// Take the body out for execution. Returns `None` on a second call.
    pub(crate) fn take_action(&mut self) -> Option<TaskAction> {
        self.action.take()
    }

    pub(crate) fn finish(&mut self, duration: Duration, success: bool) {
        self.metadata.duration = Some(duration);
        self.metadata.success = success;
    }
}

/// A task submitted for immediate dispatch.
#[derive(Debug)]
pub struct BackgroundTask {
    pub name: String,
    pub task: Task,
}

impl BackgroundTask {
    pub fn new(name: impl Into<String>, task: Task) -> Self {
        Self {
            name: name.into(),
            task,
        }
    }

    /// Stamp identity and hand back the inner task, ready for the intake channel.
    pub(crate) fn into_submission(self, id: TaskId) -> Task {
        let mut task = self.task;
        task.stamp(id, self.name, TaskKind::Background);
        task
    }
}

/// A task submitted for dispatch after a delay.
#[derive(Debug)]
pub struct ScheduledTask {
    pub name: String,
    pub task: Task,
    delay: Duration,
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, task: Task) -> Self {
        Self {
            name: name.into(),
            task,
            delay: Duration::ZERO,
        }
    }

    /// The delay requested through `schedule`. Zero until then.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub(crate) fn into_submission(self, id: TaskId) -> (Task, Duration) {
        let mut task = self.task;
        task.stamp(id, self.name, TaskKind::Scheduled);
        (task, self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubmitted_task_has_no_identity() {
        let task = Task::new(|| {});
        assert!(task.id().is_none());
        assert!(task.metadata().kind.is_none());
        assert_eq!(task.metadata().duration, None);
        assert!(!task.metadata().success);
    }

    #[test]
    fn background_submission_stamps_metadata() {
        let task = BackgroundTask::new("email digest", Task::new(|| {}))
            .into_submission(TaskId::new("id-1"));

        assert_eq!(task.id(), Some(&TaskId::new("id-1")));
        assert_eq!(task.name(), "email digest");
        assert_eq!(task.metadata().kind, Some(TaskKind::Background));
    }

    #[test]
    fn scheduled_submission_stamps_scheduled_kind() {
        let mut scheduled = ScheduledTask::new("cleanup", Task::from_future(async {}));
        assert_eq!(scheduled.delay(), Duration::ZERO);
        scheduled.set_delay(Duration::from_secs(3));

        let (task, delay) = scheduled.into_submission(TaskId::new("id-2"));

        assert_eq!(task.metadata().kind, Some(TaskKind::Scheduled));
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn action_can_only_be_taken_once() {
        let mut task = Task::new(|| {});
        assert!(matches!(task.take_action(), Some(TaskAction::Blocking(_))));
        assert!(task.take_action().is_none());
    }

    #[test]
    fn finish_records_duration_and_success() {
        let mut task = Task::new(|| {});
        task.finish(Duration::from_millis(40), true);
        assert_eq!(task.metadata().duration, Some(Duration::from_millis(40)));
        assert!(task.metadata().success);
    }

    #[test]
    fn task_kind_string_round_trip() {
        for kind in [TaskKind::Background, TaskKind::Scheduled] {
            assert_eq!(kind.to_string().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("Background".parse::<TaskKind>().is_err());
    }
}
