//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What a worker does when a task's body panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Catch the panic, record a failed event, and return to idle.
    #[default]
    Isolate,
    /// Let the panic end the worker. The pool loses that slot for good.
    Terminate,
}

impl FromStr for FaultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("expected 'isolate' or 'terminate', got '{other}'")),
        }
    }
}

impl std::fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Isolate => "isolate",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of workers, which is also the ready pool capacity.
    pub pool_size: usize,
    /// Behaviour when a task panics.
    pub fault_policy: FaultPolicy,
    /// Upper bound on a single store call before it is abandoned.
    pub store_timeout: Duration,
    /// Path of the libSQL database used by [`crate::worker::Queue::open`].
    pub db_path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            fault_policy: FaultPolicy::Isolate,
            store_timeout: Duration::from_secs(5),
            db_path: PathBuf::from("./data/taskqueue.db"),
        }
    }
}

impl QueueConfig {
    /// Build config from environment variables.
    ///
    /// Unset variables fall back to the defaults; set but unparseable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let pool_size = env_parse("TASKQUEUE_POOL_SIZE")?.unwrap_or(defaults.pool_size);

        let fault_policy =
            env_parse("TASKQUEUE_FAULT_POLICY")?.unwrap_or(defaults.fault_policy);

        let store_timeout = env_parse::<u64>("TASKQUEUE_STORE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_timeout);

        let db_path = std::env::var("TASKQUEUE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let config = Self {
            pool_size,
            fault_policy,
            store_timeout,
            db_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pool_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
