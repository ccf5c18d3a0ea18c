//! Courier Poll
//!
//! Scheduled polling consumer. A [`Poller`] supplies the protocol-specific
//! poll; the [`ScheduledPollConsumer`] runs it on a schedule with greedy
//! re-polling, backoff, repeat limits and pluggable [`PollStrategy`] hooks.

pub mod consumer;
pub mod error;
pub mod scheduler;
pub mod strategy;

pub use consumer::{
    CycleOutcome, ExceptionHandler, LoggingExceptionHandler, PollStatsSnapshot, Poller,
    ScheduledPollConsumer, ScheduledPollConsumerBuilder,
};
pub use error::{
    ConsumerError, ConsumerResult, PollError, PollResult, SchedulerError, SchedulerResult,
};
pub use scheduler::{DefaultPollScheduler, PollScheduler};
pub use strategy::{DefaultPollStrategy, LimitedPollStrategy, PollStrategy, DEFAULT_ROLLBACK_LIMIT};

pub use courier_core::{RunLoggingLevel, ScheduledPollConfig};
