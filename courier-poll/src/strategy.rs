//! Poll strategies
//!
//! A strategy wraps every poll attempt: `begin` may veto it, `commit` runs
//! after a successful poll and `rollback` decides whether a failed attempt is
//! retried within the same cycle.

use crate::consumer::ScheduledPollConsumer;
use crate::error::{PollError, PollResult};
use ahash::AHashMap;
use courier_core::Endpoint;
use parking_lot::Mutex;
use std::fmt;
use tracing::warn;

/// Hooks around each poll attempt
pub trait PollStrategy: Send + Sync {
    /// Called before polling; `false` skips the attempt
    fn begin(&self, consumer: &ScheduledPollConsumer, endpoint: &dyn Endpoint) -> PollResult<bool>;

    /// Called after a successful poll with the number of messages polled
    fn commit(
        &self,
        consumer: &ScheduledPollConsumer,
        endpoint: &dyn Endpoint,
        polled_messages: usize,
    ) -> PollResult<()>;

    /// Called when an attempt failed; `true` retries within the same cycle
    ///
    /// `retry_counter` is the number of retries already made in this cycle.
    fn rollback(
        &self,
        consumer: &ScheduledPollConsumer,
        endpoint: &dyn Endpoint,
        retry_counter: u32,
        cause: &PollError,
    ) -> PollResult<bool>;
}

/// Always begins, never retries, logs failures
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPollStrategy;

impl PollStrategy for DefaultPollStrategy {
    fn begin(&self, _consumer: &ScheduledPollConsumer, _endpoint: &dyn Endpoint) -> PollResult<bool> {
        Ok(true)
    }

    fn commit(
        &self,
        _consumer: &ScheduledPollConsumer,
        _endpoint: &dyn Endpoint,
        _polled_messages: usize,
    ) -> PollResult<()> {
        Ok(())
    }

    fn rollback(
        &self,
        _consumer: &ScheduledPollConsumer,
        endpoint: &dyn Endpoint,
        _retry_counter: u32,
        cause: &PollError,
    ) -> PollResult<bool> {
        warn!(
            endpoint_uri = endpoint.endpoint_uri(),
            error = %cause,
            "Consumer could not poll endpoint"
        );
        Ok(false)
    }
}

/// Default number of consecutive failed polls before suspending
pub const DEFAULT_ROLLBACK_LIMIT: u32 = 3;

/// Suspends a consumer after a number of consecutive failed polls
///
/// The count is kept per endpoint and reset by a successful commit. A
/// suspended consumer stays suspended until resumed explicitly.
pub struct LimitedPollStrategy {
    limit: u32,
    failures: Mutex<AHashMap<String, u32>>,
}

impl LimitedPollStrategy {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            failures: Mutex::new(AHashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Consecutive failures recorded for an endpoint
    pub fn failures(&self, endpoint_uri: &str) -> u32 {
        self.failures.lock().get(endpoint_uri).copied().unwrap_or(0)
    }

    fn process_exceeded_limit(&self, consumer: &ScheduledPollConsumer, endpoint: &dyn Endpoint) {
        warn!(
            endpoint_uri = endpoint.endpoint_uri(),
            limit = self.limit,
            "Suspending consumer after consecutive failed polls; resume it to poll again"
        );
        consumer.suspend();
    }
}

impl Default for LimitedPollStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_ROLLBACK_LIMIT)
    }
}

impl PollStrategy for LimitedPollStrategy {
    fn begin(&self, _consumer: &ScheduledPollConsumer, _endpoint: &dyn Endpoint) -> PollResult<bool> {
        Ok(true)
    }

    fn commit(
        &self,
        _consumer: &ScheduledPollConsumer,
        endpoint: &dyn Endpoint,
        _polled_messages: usize,
    ) -> PollResult<()> {
        self.failures.lock().remove(endpoint.endpoint_uri());
        Ok(())
    }

    fn rollback(
        &self,
        consumer: &ScheduledPollConsumer,
        endpoint: &dyn Endpoint,
        _retry_counter: u32,
        _cause: &PollError,
    ) -> PollResult<bool> {
        let exceeded = {
            let mut failures = self.failures.lock();
            let times = failures
                .entry(endpoint.endpoint_uri().to_string())
                .or_insert(0);
            *times += 1;
            if *times >= self.limit {
                failures.remove(endpoint.endpoint_uri());
                true
            } else {
                false
            }
        };

        if exceeded {
            self.process_exceeded_limit(consumer, endpoint);
        }
        Ok(false)
    }
}

impl fmt::Debug for LimitedPollStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedPollStrategy")
            .field("limit", &self.limit)
            .finish()
    }
}
