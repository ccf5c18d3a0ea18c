//! Unit of work and on-completion callbacks

use super::Exchange;
use courier_message::Message;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Callback run once when an exchange is done
pub trait Synchronization: Send + Sync {
    /// Called when the exchange completed without failure
    fn on_complete(&self, _exchange: &Exchange) {}

    /// Called when the exchange completed with a failure
    fn on_failure(&self, _exchange: &Exchange) {}

    /// Whether this callback may move to another exchange on hand-over
    fn allow_handover(&self) -> bool {
        true
    }
}

/// Enclosing transactional or callback scope of an exchange
///
/// The exchange holds a shared reference and does not own its lifecycle.
pub trait UnitOfWork: Send + Sync {
    fn id(&self) -> &str;

    /// Called by each exchange of this unit when it is done
    fn done(&self, exchange: &Exchange);

    /// The in message as it was when the unit of work started
    fn original_in_message(&self) -> Option<Message> {
        None
    }
}

/// Unit of work that counts the exchanges completed within it
#[derive(Default)]
pub struct DefaultUnitOfWork {
    id: String,
    original_in: Option<Message>,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl DefaultUnitOfWork {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Keep a copy of the in message the unit of work started with
    pub fn with_original_in(mut self, message: &Message) -> Self {
        self.original_in = Some(message.copy());
        self
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl UnitOfWork for DefaultUnitOfWork {
    fn id(&self) -> &str {
        &self.id
    }

    fn done(&self, exchange: &Exchange) {
        if exchange.is_failed() {
            self.failed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn original_in_message(&self) -> Option<Message> {
        self.original_in.clone()
    }
}

impl fmt::Debug for DefaultUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultUnitOfWork")
            .field("id", &self.id)
            .field("completed", &self.completed())
            .field("failed", &self.failed())
            .finish()
    }
}
