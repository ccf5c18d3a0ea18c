//! Poll consumer errors

use courier_core::{ConfigError, ExchangeError, ExecutorError, ServiceError};
use thiserror::Error;

/// Failure of a single poll attempt
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Poll failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Raised by a poll strategy while rolling back
    #[error("Rollback failed: {0}")]
    Rollback(String),
}

impl PollError {
    pub fn failed(message: impl Into<String>) -> Self {
        PollError::Failed(message.into())
    }
}

/// Result type for polling
pub type PollResult<T> = Result<T, PollError>;

/// Scheduler errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("No task scheduled")]
    NoTask,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Consumer lifecycle errors
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Result type for consumer lifecycle operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;
