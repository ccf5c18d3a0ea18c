//! Event Notification
//!
//! A simple synchronous fan-out: exchanges and consumers emit lifecycle events,
//! every enabled notifier sees them in registration order. Notifier failures are
//! logged and swallowed so an observer can never break routing.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Lifecycle events emitted by exchanges and consumers
#[derive(Debug, Clone, PartialEq)]
pub enum CourierEvent {
    ExchangeCreated { exchange_id: String },
    ExchangeCompleted { exchange_id: String, elapsed_ms: u64 },
    ExchangeFailed { exchange_id: String, error: String },
    ConsumerStarted { endpoint_uri: String },
    ConsumerStopped { endpoint_uri: String },
    ConsumerSuspended { endpoint_uri: String },
    ConsumerResumed { endpoint_uri: String },
}

impl CourierEvent {
    /// Whether this is an exchange-level event
    pub fn is_exchange_event(&self) -> bool {
        matches!(
            self,
            CourierEvent::ExchangeCreated { .. }
                | CourierEvent::ExchangeCompleted { .. }
                | CourierEvent::ExchangeFailed { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CourierEvent::ExchangeCreated { .. } => "exchange_created",
            CourierEvent::ExchangeCompleted { .. } => "exchange_completed",
            CourierEvent::ExchangeFailed { .. } => "exchange_failed",
            CourierEvent::ConsumerStarted { .. } => "consumer_started",
            CourierEvent::ConsumerStopped { .. } => "consumer_stopped",
            CourierEvent::ConsumerSuspended { .. } => "consumer_suspended",
            CourierEvent::ConsumerResumed { .. } => "consumer_resumed",
        }
    }
}

impl fmt::Display for CourierEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourierEvent::ExchangeCreated { exchange_id } => {
                write!(f, "Exchange created: {}", exchange_id)
            }
            CourierEvent::ExchangeCompleted {
                exchange_id,
                elapsed_ms,
            } => write!(f, "Exchange completed: {} took {} ms", exchange_id, elapsed_ms),
            CourierEvent::ExchangeFailed { exchange_id, error } => {
                write!(f, "Exchange failed: {} caused by {}", exchange_id, error)
            }
            CourierEvent::ConsumerStarted { endpoint_uri } => {
                write!(f, "Consumer started: {}", endpoint_uri)
            }
            CourierEvent::ConsumerStopped { endpoint_uri } => {
                write!(f, "Consumer stopped: {}", endpoint_uri)
            }
            CourierEvent::ConsumerSuspended { endpoint_uri } => {
                write!(f, "Consumer suspended: {}", endpoint_uri)
            }
            CourierEvent::ConsumerResumed { endpoint_uri } => {
                write!(f, "Consumer resumed: {}", endpoint_uri)
            }
        }
    }
}

/// Notifier failure
#[derive(Debug, Clone, Error)]
#[error("Notifier failed: {0}")]
pub struct NotifierError(pub String);

/// Receives events from the bus
pub trait EventNotifier: Send + Sync {
    /// Handle an event
    fn notify(&self, event: &CourierEvent) -> Result<(), NotifierError>;

    /// Filter for individual events
    fn is_enabled(&self, _event: &CourierEvent) -> bool {
        true
    }

    /// Skip every exchange-level event
    fn ignore_exchange_events(&self) -> bool {
        false
    }

    /// Disabled notifiers receive nothing
    fn is_disabled(&self) -> bool {
        false
    }
}

/// Event bus delivering events to registered notifiers
#[derive(Default)]
pub struct EventBus {
    notifiers: RwLock<SmallVec<[Arc<dyn EventNotifier>; 4]>>,
    metrics: EventBusMetrics,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier
    pub fn add_notifier(&self, notifier: Arc<dyn EventNotifier>) {
        self.notifiers.write().push(notifier);
    }

    /// Remove a notifier by identity
    pub fn remove_notifier(&self, notifier: &Arc<dyn EventNotifier>) -> bool {
        let mut notifiers = self.notifiers.write();
        let before = notifiers.len();
        notifiers.retain(|n| !Arc::ptr_eq(n, notifier));
        notifiers.len() != before
    }

    /// Whether any notifier is registered
    pub fn has_notifiers(&self) -> bool {
        !self.notifiers.read().is_empty()
    }

    /// Deliver an event to every interested notifier
    pub fn notify(&self, event: &CourierEvent) {
        // snapshot so a notifier may register others without deadlocking
        let notifiers: SmallVec<[Arc<dyn EventNotifier>; 4]> = self.notifiers.read().clone();
        if notifiers.is_empty() {
            return;
        }

        for notifier in notifiers.iter() {
            if notifier.is_disabled()
                || (event.is_exchange_event() && notifier.ignore_exchange_events())
                || !notifier.is_enabled(event)
            {
                self.metrics.events_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match notifier.notify(event) {
                Ok(()) => {
                    self.metrics.events_notified.fetch_add(1, Ordering::Relaxed);
                    trace!(event = event.kind(), "Event notified");
                }
                Err(e) => {
                    self.metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(event = event.kind(), error = %e, "Error notifying event. This exception will be ignored");
                }
            }
        }
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> EventBusMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("notifiers", &self.notifiers.read().len())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Event bus metrics (atomic for lock-free access)
#[derive(Debug, Default)]
pub struct EventBusMetrics {
    events_notified: AtomicU64,
    events_failed: AtomicU64,
    events_skipped: AtomicU64,
}

impl EventBusMetrics {
    fn snapshot(&self) -> EventBusMetricsSnapshot {
        EventBusMetricsSnapshot {
            events_notified: self.events_notified.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of event bus metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventBusMetricsSnapshot {
    pub events_notified: u64,
    pub events_failed: u64,
    pub events_skipped: u64,
}

/// Notifier that records every event, useful in tests and demos
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: parking_lot::Mutex<Vec<CourierEvent>>,
    ignore_exchange_events: bool,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that skips exchange events
    pub fn consumer_events_only() -> Self {
        Self {
            ignore_exchange_events: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<CourierEvent> {
        self.events.lock().clone()
    }
}

impl EventNotifier for CollectingNotifier {
    fn notify(&self, event: &CourierEvent) -> Result<(), NotifierError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn ignore_exchange_events(&self) -> bool {
        self.ignore_exchange_events
    }
}
