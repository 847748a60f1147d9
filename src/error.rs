//! Error types for the task queue.

/// Top-level error type for the task queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("{0}")]
    InvalidDuration(#[from] InvalidDurationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Connection already released")]
    Released,
}

/// Errors returned by queue lifecycle and submission calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue has not been started")]
    NotStarted,

    #[error("Queue has already been started")]
    AlreadyStarted,

    #[error("Queue is stopped")]
    Stopped,
}

/// A delay string that could not be parsed, or that parsed to a negative duration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid duration {input:?}: {reason}")]
pub struct InvalidDurationError {
    pub input: String,
    pub reason: String,
}

impl InvalidDurationError {
    pub(crate) fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the task queue.
pub type Result<T> = std::result::Result<T, Error>;
