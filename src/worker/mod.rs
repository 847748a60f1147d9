//! Worker system — bounded pool dispatch with delayed scheduling.
//!
//! Core components:
//! - `task` — Task types (Task, BackgroundTask, ScheduledTask)
//! - `worker` — Pool worker (advertise idle, run, record outcome)
//! - `queue` — Queue lifecycle and the dispatch loop
//! - `scheduler` — Delay parsing and one-shot timers

pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use queue::Queue;
pub use scheduler::{ScheduledHandle, parse_duration};
pub use task::{BackgroundTask, ScheduledTask, Task, TaskAction, TaskKind, TaskMetadata};
pub use worker::{Worker, WorkerDeps};
