//! Scheduled poll consumer
//!
//! Each scheduled run is one poll cycle:
//!
//! 1. do nothing while suspended
//! 2. skip the cycle while backing off after repeated idle or failed cycles
//! 3. unschedule once the repeat count is exceeded
//! 4. poll through the strategy's `begin`/`commit`/`rollback` hooks, retrying
//!    when the strategy asks for it and polling again at once when greedy
//! 5. update the idle, error and success counters
//!
//! Poll failures end at the exception handler and never escape the cycle.

use crate::error::{ConsumerResult, PollError, PollResult, SchedulerError};
use crate::scheduler::{DefaultPollScheduler, PollScheduler};
use crate::strategy::{DefaultPollStrategy, PollStrategy};
use async_trait::async_trait;
use courier_core::{
    CourierEvent, Endpoint, Exchange, ExchangeResult, Processor, RunLoggingLevel,
    ScheduledExecutor, ScheduledPollConfig, ScheduledTask, ServiceState, ServiceStatus,
};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Protocol-specific polling
#[async_trait]
pub trait Poller: Send + Sync {
    /// Poll the source once, returning the number of messages handled
    ///
    /// Implementations create exchanges through `consumer.endpoint()` and hand
    /// them to `consumer.process()`.
    async fn poll(&self, consumer: &ScheduledPollConsumer) -> PollResult<usize>;
}

/// Receives poll failures that the strategy did not retry
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, message: &str, error: &PollError);
}

/// Logs poll failures at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, message: &str, error: &PollError) {
        warn!(error = %error, "{}", message);
    }
}

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Consumer suspended, nothing done
    Suspended,
    /// Cycle skipped while backing off
    BackedOff,
    /// Repeat count exceeded; the task was unscheduled
    RepeatLimitReached,
    /// Polling ran; `last_polled` is the message count of the final poll
    Polled { last_polled: usize, failed: bool },
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStatsSnapshot {
    /// Cycles that got past backoff
    pub counter: u64,
    /// Consecutive successful cycles
    pub success: u64,
    /// Consecutive cycles that polled nothing
    pub idle: u32,
    /// Consecutive failed cycles
    pub error: u32,
    /// Cycles skipped in the current backoff
    pub backoff: u32,
}

#[derive(Debug, Default)]
struct PollStats {
    counter: AtomicU64,
    success: AtomicU64,
    idle: AtomicU32,
    error: AtomicU32,
    backoff: AtomicU32,
}

impl PollStats {
    fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            counter: self.counter.load(Ordering::Acquire),
            success: self.success.load(Ordering::Acquire),
            idle: self.idle.load(Ordering::Acquire),
            error: self.error.load(Ordering::Acquire),
            backoff: self.backoff.load(Ordering::Acquire),
        }
    }

    fn reset_backoff(&self) {
        self.idle.store(0, Ordering::Release);
        self.error.store(0, Ordering::Release);
        self.backoff.store(0, Ordering::Release);
        self.success.store(0, Ordering::Release);
    }

    fn reset(&self) {
        self.reset_backoff();
        self.counter.store(0, Ordering::Release);
    }
}

/// Keeps `is_polling` accurate even when a poll unwinds
struct PollingFlag<'a>(&'a AtomicBool);

impl<'a> PollingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for PollingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

macro_rules! run_log {
    ($level:expr, $uri:expr, $msg:literal) => {
        match $level {
            RunLoggingLevel::Trace => trace!(endpoint_uri = $uri, $msg),
            RunLoggingLevel::Debug => debug!(endpoint_uri = $uri, $msg),
            RunLoggingLevel::Info => info!(endpoint_uri = $uri, $msg),
            RunLoggingLevel::Warn => warn!(endpoint_uri = $uri, $msg),
            RunLoggingLevel::Error => error!(endpoint_uri = $uri, $msg),
            RunLoggingLevel::Off => {}
        }
    };
}

/// Consumer that polls its source on a schedule
pub struct ScheduledPollConsumer {
    endpoint: Arc<dyn Endpoint>,
    processor: Arc<dyn Processor>,
    poller: Arc<dyn Poller>,
    config: ScheduledPollConfig,
    strategy: Arc<dyn PollStrategy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    executor: Option<ScheduledExecutor>,
    scheduler: Mutex<Option<Arc<dyn PollScheduler>>>,
    state: ServiceState,
    start_scheduler: AtomicBool,
    stats: PollStats,
    polling: AtomicBool,
    first_poll_done: AtomicBool,
    force_ready: AtomicBool,
    last_error: Mutex<Option<Arc<PollError>>>,
    weak_self: Weak<ScheduledPollConsumer>,
}

impl ScheduledPollConsumer {
    pub fn builder(
        endpoint: Arc<dyn Endpoint>,
        poller: Arc<dyn Poller>,
    ) -> ScheduledPollConsumerBuilder {
        ScheduledPollConsumerBuilder::new(endpoint, poller)
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn config(&self) -> &ScheduledPollConfig {
        &self.config
    }

    /// Hand an exchange to the downstream processor
    pub async fn process(&self, exchange: &mut Exchange) -> ExchangeResult<()> {
        self.processor.process(exchange).await
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.status()
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn stats(&self) -> PollStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a poll is in progress
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub fn is_first_poll_done(&self) -> bool {
        self.first_poll_done.load(Ordering::Acquire)
    }

    /// Ready once forced or after the first completed cycle
    pub fn is_consumer_ready(&self) -> bool {
        self.force_ready.load(Ordering::Acquire) || self.is_first_poll_done()
    }

    pub fn force_consumer_ready(&self) {
        self.force_ready.store(true, Ordering::Release);
    }

    /// Cause of the last failed cycle, cleared by a successful one
    pub fn last_error(&self) -> Option<Arc<PollError>> {
        self.last_error.lock().clone()
    }

    pub fn is_scheduler_started(&self) -> bool {
        self.current_scheduler()
            .is_some_and(|scheduler| scheduler.is_scheduler_started())
    }

    fn current_scheduler(&self) -> Option<Arc<dyn PollScheduler>> {
        self.scheduler.lock().clone()
    }

    fn scheduler_or_default(&self) -> Result<Arc<dyn PollScheduler>, SchedulerError> {
        let mut slot = self.scheduler.lock();
        if let Some(scheduler) = slot.as_ref() {
            return Ok(Arc::clone(scheduler));
        }
        let executor = match &self.executor {
            Some(executor) => executor.clone(),
            None => ScheduledExecutor::new(format!("poll-{}", self.endpoint.endpoint_uri()))?,
        };
        let scheduler: Arc<dyn PollScheduler> =
            Arc::new(DefaultPollScheduler::from_config(executor, &self.config));
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    // -- lifecycle --

    /// Start the consumer and schedule its poll cycle
    ///
    /// The scheduler itself only starts when `start_scheduler` is set or
    /// [`on_init`](Self::on_init) was called.
    pub fn start(&self) -> ConsumerResult<()> {
        if self.state.is_run_allowed() {
            return Ok(());
        }
        let uri = self.endpoint.endpoint_uri();
        let scheduler = self.scheduler_or_default()?;
        scheduler.on_init(self)?;

        let task: Arc<dyn ScheduledTask> = self.weak_self.upgrade().ok_or(SchedulerError::NoTask)?;
        self.state.set(ServiceStatus::Started);
        let scheduled = scheduler.schedule_task(task).and_then(|()| {
            if self.start_scheduler.load(Ordering::Acquire) {
                scheduler.start_scheduler()
            } else {
                Ok(())
            }
        });
        if let Err(e) = scheduled {
            scheduler.unschedule_task();
            self.state.set(ServiceStatus::Stopped);
            return Err(e.into());
        }

        info!(endpoint_uri = uri, scheduler_started = scheduler.is_scheduler_started(), "Consumer started");
        self.notify(CourierEvent::ConsumerStarted {
            endpoint_uri: uri.to_string(),
        });
        Ok(())
    }

    /// Start the scheduler of a consumer started with `start_scheduler` off
    pub fn start_scheduler(&self) -> ConsumerResult<()> {
        let scheduler = self.current_scheduler().ok_or(SchedulerError::NoTask)?;
        scheduler.start_scheduler()?;
        Ok(())
    }

    /// Stop polling and reset counters and readiness
    pub fn stop(&self) {
        if self.state.is_stopped() {
            return;
        }
        if let Some(scheduler) = self.current_scheduler() {
            scheduler.unschedule_task();
        }
        self.stats.reset();
        self.first_poll_done.store(false, Ordering::Release);
        self.force_ready.store(false, Ordering::Release);
        self.state.set(ServiceStatus::Stopped);

        let uri = self.endpoint.endpoint_uri();
        info!(endpoint_uri = uri, "Consumer stopped");
        self.notify(CourierEvent::ConsumerStopped {
            endpoint_uri: uri.to_string(),
        });
    }

    /// Suspend a started consumer; scheduled runs keep firing but do nothing
    pub fn suspend(&self) -> bool {
        if !self
            .state
            .transition(ServiceStatus::Started, ServiceStatus::Suspended)
        {
            return false;
        }
        let uri = self.endpoint.endpoint_uri();
        debug!(endpoint_uri = uri, "Consumer suspended");
        self.notify(CourierEvent::ConsumerSuspended {
            endpoint_uri: uri.to_string(),
        });
        true
    }

    /// Resume a suspended consumer
    pub fn resume(&self) -> bool {
        if !self
            .state
            .transition(ServiceStatus::Suspended, ServiceStatus::Started)
        {
            return false;
        }
        let uri = self.endpoint.endpoint_uri();
        debug!(endpoint_uri = uri, "Consumer resumed");
        self.notify(CourierEvent::ConsumerResumed {
            endpoint_uri: uri.to_string(),
        });
        true
    }

    /// Prepare for on-demand polling: the scheduler starts with the consumer
    pub fn on_init(&self) {
        self.start_scheduler.store(true, Ordering::Release);
    }

    /// Resume or start before an on-demand poll
    ///
    /// Returns the timeout to wait for a result, at least one poll delay.
    pub fn before_poll(&self, timeout: Duration) -> ConsumerResult<Duration> {
        trace!(endpoint_uri = self.endpoint.endpoint_uri(), "Before poll");
        if !self.resume() {
            self.start()?;
        }
        Ok(timeout.max(self.config.delay()))
    }

    /// Suspend, or stop when suspending is not possible, after an on-demand poll
    pub fn after_poll(&self) {
        trace!(endpoint_uri = self.endpoint.endpoint_uri(), "After poll");
        if !self.suspend() {
            self.stop();
        }
    }

    fn notify(&self, event: CourierEvent) {
        self.endpoint.context().events().notify(&event);
    }

    // -- polling --

    fn is_poll_allowed(&self) -> bool {
        self.state.is_started()
    }

    fn should_back_off(&self) -> bool {
        let config = &self.config;
        if config.backoff_multiplier == 0 {
            return false;
        }
        let idle_reached = config.backoff_idle_threshold > 0
            && self.stats.idle.load(Ordering::Acquire) >= config.backoff_idle_threshold;
        let error_reached = config.backoff_error_threshold > 0
            && self.stats.error.load(Ordering::Acquire) >= config.backoff_error_threshold;
        idle_reached || error_reached
    }

    /// Run one poll cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        let uri = self.endpoint.endpoint_uri();
        if self.state.is_suspended() {
            trace!(endpoint_uri = uri, "Cannot start to poll as consumer is suspended");
            return CycleOutcome::Suspended;
        }

        if self.should_back_off() {
            let multiplier = self.config.backoff_multiplier;
            let skipped = self.stats.backoff.fetch_add(1, Ordering::AcqRel) + 1;
            if skipped <= multiplier {
                let idle = self.stats.idle.load(Ordering::Acquire);
                if idle > 0 {
                    debug!(endpoint_uri = uri, idle, skipped, multiplier, "Backing off after consecutive idle polls");
                } else {
                    let errors = self.stats.error.load(Ordering::Acquire);
                    debug!(endpoint_uri = uri, errors, skipped, multiplier, "Backing off after consecutive failed polls");
                }
                return CycleOutcome::BackedOff;
            }
            self.stats.reset_backoff();
            trace!(endpoint_uri = uri, "Backoff finished, resetting counters");
        }

        let count = self.stats.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let repeat_count = self.config.repeat_count;
        if repeat_count > 0 && count > repeat_count {
            debug!(endpoint_uri = uri, repeat_count, "Cancelling scheduler as repeat count limit reached");
            if let Some(scheduler) = self.current_scheduler() {
                scheduler.unschedule_task();
            }
            return CycleOutcome::RepeatLimitReached;
        }

        let mut retry_counter: Option<u32> = None;
        let mut polled_messages = 0usize;
        let mut cause: Option<PollError>;

        loop {
            cause = None;
            let mut done = true;

            if self.is_poll_allowed() {
                match retry_counter {
                    None => trace!(endpoint_uri = uri, "Starting to poll"),
                    Some(retry) => debug!(endpoint_uri = uri, attempt = retry + 1, "Retrying poll"),
                }

                let attempt = {
                    let _polling = PollingFlag::raise(&self.polling);
                    self.poll_once(&mut retry_counter, &mut polled_messages).await
                };

                match attempt {
                    Ok(true) => {
                        done = false;
                        retry_counter = None;
                        self.stats.error.store(0, Ordering::Release);
                        self.last_error.lock().take();
                        self.first_poll_done.store(true, Ordering::Release);
                        trace!(endpoint_uri = uri, polled_messages, "Greedy polling after processing messages");
                    }
                    Ok(false) => trace!(endpoint_uri = uri, "Finished polling"),
                    Err(e) => {
                        let retries = retry_counter.unwrap_or(0);
                        match self.strategy.rollback(self, self.endpoint.as_ref(), retries, &e) {
                            Ok(true) => done = false,
                            Ok(false) => cause = Some(e),
                            Err(rollback_error) => cause = Some(rollback_error),
                        }
                    }
                }
            }

            if let Some(error) = &cause {
                if self.state.is_run_allowed() {
                    self.handle_exception(error);
                }
            }
            if done {
                break;
            }
        }

        let failed = cause.is_some();
        match cause {
            Some(error) => {
                self.stats.idle.store(0, Ordering::Release);
                self.stats.success.store(0, Ordering::Release);
                self.stats.error.fetch_add(1, Ordering::AcqRel);
                *self.last_error.lock() = Some(Arc::new(error));
            }
            None => {
                if polled_messages == 0 {
                    self.stats.idle.fetch_add(1, Ordering::AcqRel);
                } else {
                    self.stats.idle.store(0, Ordering::Release);
                }
                self.stats.success.fetch_add(1, Ordering::AcqRel);
                self.stats.error.store(0, Ordering::Release);
                self.last_error.lock().take();
            }
        }
        self.first_poll_done.store(true, Ordering::Release);

        let stats = self.stats.snapshot();
        trace!(
            endpoint_uri = uri,
            idle = stats.idle,
            success = stats.success,
            error = stats.error,
            "Poll cycle done"
        );
        CycleOutcome::Polled {
            last_polled: polled_messages,
            failed,
        }
    }

    /// One begin/poll/commit round; `Ok(true)` asks for a greedy re-poll
    async fn poll_once(
        &self,
        retry_counter: &mut Option<u32>,
        polled_messages: &mut usize,
    ) -> PollResult<bool> {
        let endpoint = self.endpoint.as_ref();
        if !self.strategy.begin(self, endpoint)? {
            debug!(endpoint_uri = endpoint.endpoint_uri(), "Cannot begin polling as poll strategy returned false");
            return Ok(false);
        }

        *retry_counter = Some(retry_counter.map_or(0, |retry| retry + 1));
        *polled_messages = self.poller.poll(self).await?;
        trace!(endpoint_uri = endpoint.endpoint_uri(), polled = *polled_messages, "Polled messages");

        if *polled_messages == 0 && self.config.send_empty_message_when_idle {
            self.process_empty_message().await?;
        }
        self.strategy.commit(self, endpoint, *polled_messages)?;

        Ok(*polled_messages > 0 && self.config.greedy)
    }

    async fn process_empty_message(&self) -> PollResult<()> {
        let mut exchange = self.endpoint.create_exchange();
        debug!(
            endpoint_uri = self.endpoint.endpoint_uri(),
            "Sending empty message as there were no messages from polling"
        );
        self.processor.process(&mut exchange).await?;
        Ok(())
    }

    fn handle_exception(&self, cause: &PollError) {
        let message = format!(
            "Failed polling endpoint: {}. Will try again at next poll",
            self.endpoint.endpoint_uri()
        );
        let handler = &self.exception_handler;
        if catch_unwind(AssertUnwindSafe(|| handler.handle_exception(&message, cause))).is_err() {
            warn!(
                endpoint_uri = self.endpoint.endpoint_uri(),
                "Error handling exception. This exception will be ignored"
            );
        }
    }
}

#[async_trait]
impl ScheduledTask for ScheduledPollConsumer {
    async fn run(&self) {
        let uri = self.endpoint.endpoint_uri();
        let level = self.config.run_logging_level;
        run_log!(level, uri, "Scheduled task started");
        self.run_cycle().await;
        run_log!(level, uri, "Scheduled task completed");
    }
}

impl fmt::Debug for ScheduledPollConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledPollConsumer")
            .field("endpoint_uri", &self.endpoint.endpoint_uri())
            .field("status", &self.state.status())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Builder for [`ScheduledPollConsumer`]
pub struct ScheduledPollConsumerBuilder {
    endpoint: Arc<dyn Endpoint>,
    poller: Arc<dyn Poller>,
    processor: Option<Arc<dyn Processor>>,
    config: ScheduledPollConfig,
    strategy: Option<Arc<dyn PollStrategy>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    scheduler: Option<Arc<dyn PollScheduler>>,
    executor: Option<ScheduledExecutor>,
}

impl ScheduledPollConsumerBuilder {
    pub fn new(endpoint: Arc<dyn Endpoint>, poller: Arc<dyn Poller>) -> Self {
        Self {
            endpoint,
            poller,
            processor: None,
            config: ScheduledPollConfig::default(),
            strategy: None,
            exception_handler: None,
            scheduler: None,
            executor: None,
        }
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn config(mut self, config: ScheduledPollConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn PollStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Use a custom scheduler instead of the default one
    pub fn scheduler(mut self, scheduler: Arc<dyn PollScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Executor for the default scheduler, instead of one on the current runtime
    pub fn executor(mut self, executor: ScheduledExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate the settings and build the consumer
    pub fn build(self) -> ConsumerResult<Arc<ScheduledPollConsumer>> {
        self.config.validate()?;
        let config = self.config;
        if config.backoff_multiplier > 0 {
            debug!(
                endpoint_uri = self.endpoint.endpoint_uri(),
                multiplier = config.backoff_multiplier,
                idle_threshold = config.backoff_idle_threshold,
                error_threshold = config.backoff_error_threshold,
                "Using backoff"
            );
        }

        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(|_: &mut Exchange| -> ExchangeResult<()> { Ok(()) }));
        let start_scheduler = config.start_scheduler;

        Ok(Arc::new_cyclic(|weak_self| ScheduledPollConsumer {
            endpoint: self.endpoint,
            processor,
            poller: self.poller,
            config,
            strategy: self.strategy.unwrap_or_else(|| Arc::new(DefaultPollStrategy)),
            exception_handler: self
                .exception_handler
                .unwrap_or_else(|| Arc::new(LoggingExceptionHandler)),
            executor: self.executor,
            scheduler: Mutex::new(self.scheduler),
            state: ServiceState::new(),
            start_scheduler: AtomicBool::new(start_scheduler),
            stats: PollStats::default(),
            polling: AtomicBool::new(false),
            first_poll_done: AtomicBool::new(false),
            force_ready: AtomicBool::new(false),
            last_error: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }
}
