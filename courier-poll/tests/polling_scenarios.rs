use async_trait::async_trait;
use courier_core::{
    CollectingNotifier, Context, CourierEvent, DefaultEndpoint, Endpoint, Exchange, ExchangeResult,
    ServiceStatus, Value,
};
use courier_poll::{
    ConsumerError, CycleOutcome, ExceptionHandler, LimitedPollStrategy, PollError, PollResult,
    PollStrategy, Poller, ScheduledPollConfig, ScheduledPollConsumer,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const URI: &str = "file:inbox";

/// Returns scripted results, then `fallback` forever (`None` fails)
struct ScriptedPoller {
    script: Mutex<VecDeque<PollResult<usize>>>,
    fallback: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedPoller {
    fn new(script: Vec<PollResult<usize>>, fallback: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn idle() -> Arc<Self> {
        Self::new(Vec::new(), Some(0))
    }

    fn failing() -> Arc<Self> {
        Self::new(Vec::new(), None)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Poller for ScriptedPoller {
    async fn poll(&self, _consumer: &ScheduledPollConsumer) -> PollResult<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script.lock().pop_front() {
            return result;
        }
        match self.fallback {
            Some(n) => Ok(n),
            None => Err(PollError::failed("source unavailable")),
        }
    }
}

/// Delivers two exchanges per poll
struct DeliveringPoller;

#[async_trait]
impl Poller for DeliveringPoller {
    async fn poll(&self, consumer: &ScheduledPollConsumer) -> PollResult<usize> {
        for n in 0..2i64 {
            let mut exchange = consumer.endpoint().create_exchange();
            exchange.in_message_mut().set_body(n);
            consumer.process(&mut exchange).await?;
        }
        Ok(2)
    }
}

/// Panics on its first call, then finds nothing
struct PanicOncePoller {
    calls: AtomicUsize,
}

#[async_trait]
impl Poller for PanicOncePoller {
    async fn poll(&self, _consumer: &ScheduledPollConsumer) -> PollResult<usize> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("poller bug");
        }
        Ok(0)
    }
}

/// Retries up to `max_retries` times and records the retry counters it saw
struct RetryingStrategy {
    max_retries: u32,
    seen: Mutex<Vec<u32>>,
}

impl PollStrategy for RetryingStrategy {
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
        _endpoint: &dyn Endpoint,
        retry_counter: u32,
        _cause: &PollError,
    ) -> PollResult<bool> {
        self.seen.lock().push(retry_counter);
        Ok(retry_counter < self.max_retries)
    }
}

/// Never lets a poll begin
struct ClosedStrategy;

impl PollStrategy for ClosedStrategy {
    fn begin(&self, _consumer: &ScheduledPollConsumer, _endpoint: &dyn Endpoint) -> PollResult<bool> {
        Ok(false)
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
        _endpoint: &dyn Endpoint,
        _retry_counter: u32,
        _cause: &PollError,
    ) -> PollResult<bool> {
        Err(PollError::Rollback("cannot roll back".to_string()))
    }
}

/// Rollback itself fails
struct BrokenRollback;

impl PollStrategy for BrokenRollback {
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
        _endpoint: &dyn Endpoint,
        _retry_counter: u32,
        _cause: &PollError,
    ) -> PollResult<bool> {
        Err(PollError::Rollback("transaction lost".to_string()))
    }
}

#[derive(Default)]
struct CollectingHandler {
    messages: Mutex<Vec<String>>,
}

impl ExceptionHandler for CollectingHandler {
    fn handle_exception(&self, message: &str, error: &PollError) {
        self.messages.lock().push(format!("{message}: {error}"));
    }
}

struct PanickingHandler;

impl ExceptionHandler for PanickingHandler {
    fn handle_exception(&self, _message: &str, _error: &PollError) {
        panic!("handler blew up");
    }
}

fn manual_config() -> ScheduledPollConfig {
    ScheduledPollConfig {
        initial_delay_ms: 60_000,
        start_scheduler: false,
        ..ScheduledPollConfig::default()
    }
}

fn endpoint() -> (Arc<Context>, Arc<dyn Endpoint>) {
    let context = Context::new("poll-test");
    let endpoint: Arc<dyn Endpoint> = Arc::new(DefaultEndpoint::new(&context, URI));
    (context, endpoint)
}

fn started(config: ScheduledPollConfig, poller: Arc<dyn Poller>) -> Arc<ScheduledPollConsumer> {
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, poller)
        .config(config)
        .build()
        .unwrap();
    consumer.start().unwrap();
    consumer
}

#[tokio::test]
async fn test_backoff_skips_cycles_then_resets() {
    let poller = ScriptedPoller::idle();
    let config = ScheduledPollConfig {
        backoff_multiplier: 3,
        backoff_idle_threshold: 2,
        ..manual_config()
    };
    let consumer = started(config, poller.clone());

    let idle = CycleOutcome::Polled {
        last_polled: 0,
        failed: false,
    };
    assert_eq!(consumer.run_cycle().await, idle);
    assert_eq!(consumer.run_cycle().await, idle);
    assert_eq!(consumer.stats().idle, 2);

    for _ in 0..3 {
        assert_eq!(consumer.run_cycle().await, CycleOutcome::BackedOff);
    }
    assert_eq!(poller.calls(), 2);
    assert_eq!(consumer.stats().backoff, 3);

    assert_eq!(consumer.run_cycle().await, idle);
    assert_eq!(poller.calls(), 3);
    let stats = consumer.stats();
    assert_eq!(stats.backoff, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.counter, 3);
}

#[tokio::test]
async fn test_backoff_after_errors() {
    let poller = ScriptedPoller::failing();
    let config = ScheduledPollConfig {
        backoff_multiplier: 1,
        backoff_error_threshold: 1,
        ..manual_config()
    };
    let consumer = started(config, poller.clone());

    assert!(matches!(
        consumer.run_cycle().await,
        CycleOutcome::Polled { failed: true, .. }
    ));
    assert_eq!(consumer.stats().error, 1);
    assert_eq!(consumer.run_cycle().await, CycleOutcome::BackedOff);
    assert!(matches!(
        consumer.run_cycle().await,
        CycleOutcome::Polled { failed: true, .. }
    ));
    assert_eq!(poller.calls(), 2);
}

#[tokio::test]
async fn test_greedy_polls_until_empty() {
    let poller = ScriptedPoller::new(vec![Ok(2), Ok(1), Ok(0)], Some(0));
    let config = ScheduledPollConfig {
        greedy: true,
        ..manual_config()
    };
    let consumer = started(config, poller.clone());

    let outcome = consumer.run_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Polled {
            last_polled: 0,
            failed: false
        }
    );
    assert_eq!(poller.calls(), 3);
    assert_eq!(consumer.stats().counter, 1);
}

#[tokio::test]
async fn test_non_greedy_polls_once_per_cycle() {
    let poller = ScriptedPoller::new(vec![Ok(2), Ok(1)], Some(0));
    let consumer = started(manual_config(), poller.clone());

    assert_eq!(
        consumer.run_cycle().await,
        CycleOutcome::Polled {
            last_polled: 2,
            failed: false
        }
    );
    assert_eq!(poller.calls(), 1);
    assert_eq!(consumer.stats().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_count_unschedules() {
    let poller = ScriptedPoller::new(Vec::new(), Some(1));
    let config = ScheduledPollConfig {
        repeat_count: 1,
        start_scheduler: true,
        ..manual_config()
    };
    let consumer = started(config, poller.clone());
    assert!(consumer.is_scheduler_started());

    assert!(matches!(consumer.run_cycle().await, CycleOutcome::Polled { .. }));
    assert_eq!(consumer.run_cycle().await, CycleOutcome::RepeatLimitReached);
    assert_eq!(poller.calls(), 1);
    assert!(!consumer.is_scheduler_started());
}

#[tokio::test]
async fn test_strategy_retries_within_cycle() {
    let poller = ScriptedPoller::new(
        vec![Err(PollError::failed("one")), Err(PollError::failed("two")), Ok(1)],
        Some(0),
    );
    let strategy = Arc::new(RetryingStrategy {
        max_retries: 2,
        seen: Mutex::new(Vec::new()),
    });
    let handler = Arc::new(CollectingHandler::default());
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, poller.clone())
        .config(manual_config())
        .strategy(strategy.clone())
        .exception_handler(handler.clone())
        .build()
        .unwrap();
    consumer.start().unwrap();

    assert_eq!(
        consumer.run_cycle().await,
        CycleOutcome::Polled {
            last_polled: 1,
            failed: false
        }
    );
    assert_eq!(poller.calls(), 3);
    assert_eq!(*strategy.seen.lock(), vec![0, 1]);
    assert!(handler.messages.lock().is_empty());
    assert!(consumer.last_error().is_none());
}

#[tokio::test]
async fn test_failure_reaches_exception_handler() {
    let handler = Arc::new(CollectingHandler::default());
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::failing())
        .config(manual_config())
        .exception_handler(handler.clone())
        .build()
        .unwrap();
    consumer.start().unwrap();

    assert_eq!(
        consumer.run_cycle().await,
        CycleOutcome::Polled {
            last_polled: 0,
            failed: true
        }
    );
    let messages = handler.messages.lock().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("Failed polling endpoint: file:inbox"));
    assert!(messages[0].ends_with("Poll failed: source unavailable"));

    let stats = consumer.stats();
    assert_eq!(stats.error, 1);
    assert_eq!(stats.success, 0);
    assert!(matches!(
        consumer.last_error().as_deref(),
        Some(PollError::Failed(_))
    ));
    assert!(consumer.is_first_poll_done());
}

#[tokio::test]
async fn test_success_clears_last_error() {
    let poller = ScriptedPoller::new(vec![Err(PollError::failed("once"))], Some(3));
    let consumer = started(manual_config(), poller);

    consumer.run_cycle().await;
    assert!(consumer.last_error().is_some());
    consumer.run_cycle().await;
    assert!(consumer.last_error().is_none());
    assert_eq!(consumer.stats().error, 0);
    assert_eq!(consumer.stats().success, 1);
}

#[tokio::test]
async fn test_rollback_error_becomes_cause() {
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::failing())
        .config(manual_config())
        .strategy(Arc::new(BrokenRollback))
        .build()
        .unwrap();
    consumer.start().unwrap();

    consumer.run_cycle().await;
    assert!(matches!(
        consumer.last_error().as_deref(),
        Some(PollError::Rollback(_))
    ));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::failing())
        .config(manual_config())
        .exception_handler(Arc::new(PanickingHandler))
        .build()
        .unwrap();
    consumer.start().unwrap();

    assert!(matches!(
        consumer.run_cycle().await,
        CycleOutcome::Polled { failed: true, .. }
    ));
    assert_eq!(consumer.stats().error, 1);
}

#[tokio::test]
async fn test_begin_veto_skips_poll() {
    let poller = ScriptedPoller::idle();
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, poller.clone())
        .config(manual_config())
        .strategy(Arc::new(ClosedStrategy))
        .build()
        .unwrap();
    consumer.start().unwrap();

    assert_eq!(
        consumer.run_cycle().await,
        CycleOutcome::Polled {
            last_polled: 0,
            failed: false
        }
    );
    assert_eq!(poller.calls(), 0);
    assert_eq!(consumer.stats().idle, 1);
}

#[tokio::test]
async fn test_limited_strategy_suspends_consumer() {
    let (context, endpoint) = endpoint();
    let events = Arc::new(CollectingNotifier::consumer_events_only());
    context.events().add_notifier(events.clone());
    let strategy = Arc::new(LimitedPollStrategy::new(2));
    let poller = ScriptedPoller::failing();

    let consumer = ScheduledPollConsumer::builder(endpoint, poller.clone())
        .config(manual_config())
        .strategy(strategy.clone())
        .build()
        .unwrap();
    consumer.start().unwrap();

    consumer.run_cycle().await;
    assert_eq!(strategy.failures(URI), 1);
    assert!(!consumer.is_suspended());

    consumer.run_cycle().await;
    assert!(consumer.is_suspended());
    assert_eq!(strategy.failures(URI), 0);

    assert_eq!(consumer.run_cycle().await, CycleOutcome::Suspended);
    assert_eq!(poller.calls(), 2);

    assert!(consumer.resume());
    assert_eq!(
        events.events(),
        vec![
            CourierEvent::ConsumerStarted {
                endpoint_uri: URI.to_string()
            },
            CourierEvent::ConsumerSuspended {
                endpoint_uri: URI.to_string()
            },
            CourierEvent::ConsumerResumed {
                endpoint_uri: URI.to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_empty_message_when_idle() {
    let (_, endpoint) = endpoint();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let processor = move |exchange: &mut Exchange| -> ExchangeResult<()> {
        let from = exchange.from_endpoint().unwrap_or_default().to_string();
        recorder.lock().push((from, exchange.in_message().body().clone()));
        Ok(())
    };
    let config = ScheduledPollConfig {
        send_empty_message_when_idle: true,
        ..manual_config()
    };
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::idle())
        .config(config)
        .processor(Arc::new(processor))
        .build()
        .unwrap();
    consumer.start().unwrap();

    consumer.run_cycle().await;
    consumer.run_cycle().await;
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (URI.to_string(), Value::Null));
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_drives_cycles_until_stopped() {
    let (_, endpoint) = endpoint();
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let processor = move |_: &mut Exchange| -> ExchangeResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let config = ScheduledPollConfig {
        initial_delay_ms: 100,
        delay_ms: 100,
        ..ScheduledPollConfig::default()
    };
    let consumer = ScheduledPollConsumer::builder(endpoint, Arc::new(DeliveringPoller))
        .config(config)
        .processor(Arc::new(processor))
        .build()
        .unwrap();
    consumer.start().unwrap();
    assert!(consumer.is_scheduler_started());
    assert!(!consumer.is_consumer_ready());

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 6);
    assert_eq!(consumer.stats().counter, 3);
    assert!(consumer.is_consumer_ready());

    consumer.stop();
    assert_eq!(consumer.status(), ServiceStatus::Stopped);
    assert!(!consumer.is_scheduler_started());
    assert_eq!(consumer.stats().counter, 0);
    assert!(!consumer.is_consumer_ready());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_cycles_continue_after_poller_panic() {
    let poller = Arc::new(PanicOncePoller {
        calls: AtomicUsize::new(0),
    });
    let config = ScheduledPollConfig {
        initial_delay_ms: 100,
        delay_ms: 100,
        ..ScheduledPollConfig::default()
    };
    let consumer = started(config, poller.clone());

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert!(poller.calls.load(Ordering::SeqCst) >= 4);
    assert!(consumer.is_started());
    assert!(consumer.is_scheduler_started());
    assert!(!consumer.is_polling());
    assert!(consumer.is_first_poll_done());

    consumer.stop();
}

#[tokio::test(start_paused = true)]
async fn test_manual_scheduler_start() {
    let consumer = started(manual_config(), ScriptedPoller::idle());
    assert!(consumer.is_started());
    assert!(!consumer.is_scheduler_started());

    consumer.start_scheduler().unwrap();
    assert!(consumer.is_scheduler_started());
    consumer.stop();
}

#[tokio::test(start_paused = true)]
async fn test_on_init_starts_scheduler_with_consumer() {
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::idle())
        .config(manual_config())
        .build()
        .unwrap();
    consumer.on_init();
    consumer.start().unwrap();
    assert!(consumer.is_scheduler_started());
    consumer.stop();
}

#[tokio::test(start_paused = true)]
async fn test_before_and_after_poll() {
    let (context, endpoint) = endpoint();
    let events = Arc::new(CollectingNotifier::consumer_events_only());
    context.events().add_notifier(events.clone());
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::idle())
        .config(manual_config())
        .build()
        .unwrap();

    let timeout = consumer.before_poll(Duration::from_millis(100)).unwrap();
    assert_eq!(timeout, Duration::from_millis(500));
    assert!(consumer.is_started());

    consumer.after_poll();
    assert!(consumer.is_suspended());

    let timeout = consumer.before_poll(Duration::from_secs(2)).unwrap();
    assert_eq!(timeout, Duration::from_secs(2));
    assert!(consumer.is_started());

    consumer.after_poll();
    consumer.after_poll();
    assert_eq!(consumer.status(), ServiceStatus::Stopped);

    let uri = URI.to_string();
    assert_eq!(
        events.events(),
        vec![
            CourierEvent::ConsumerStarted { endpoint_uri: uri.clone() },
            CourierEvent::ConsumerSuspended { endpoint_uri: uri.clone() },
            CourierEvent::ConsumerResumed { endpoint_uri: uri.clone() },
            CourierEvent::ConsumerSuspended { endpoint_uri: uri.clone() },
            CourierEvent::ConsumerStopped { endpoint_uri: uri },
        ]
    );
}

#[tokio::test]
async fn test_force_consumer_ready() {
    let consumer = started(manual_config(), ScriptedPoller::idle());
    assert!(!consumer.is_consumer_ready());
    consumer.force_consumer_ready();
    assert!(consumer.is_consumer_ready());
    assert!(!consumer.is_first_poll_done());
}

#[test]
fn test_invalid_backoff_config_rejected() {
    let (_, endpoint) = endpoint();
    let config = ScheduledPollConfig {
        backoff_multiplier: 2,
        ..ScheduledPollConfig::default()
    };
    let result = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::idle())
        .config(config)
        .build();
    assert!(matches!(result, Err(ConsumerError::Config(_))));
}

#[test]
fn test_start_outside_runtime_fails() {
    let (_, endpoint) = endpoint();
    let consumer = ScheduledPollConsumer::builder(endpoint, ScriptedPoller::idle())
        .build()
        .unwrap();
    assert!(matches!(consumer.start(), Err(ConsumerError::Scheduler(_))));
    assert_eq!(consumer.status(), ServiceStatus::Initialized);
}
