//! Task Queue — in-process background and delayed task dispatch.

pub mod config;
pub mod error;
pub mod id;
pub mod store;
pub mod worker;

pub use config::{FaultPolicy, QueueConfig};
pub use error::{Error, QueueError, Result};
pub use worker::{BackgroundTask, Queue, ScheduledTask, Task};
