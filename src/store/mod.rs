//! Persistence layer — lifecycle event recorders.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{Collection, LibSqlConnector, LibSqlStore, SucceededRecord};
pub use memory::{LifecycleEvent, MemoryStore};
pub use traits::{StoreConnector, TaskStore};
