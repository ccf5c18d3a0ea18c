//! Service lifecycle
//!
//! [`ServiceState`] is the shared status cell used by consumers and timeout
//! maps. [`Stoppable`] is the optional stop capability that eviction listeners
//! probe through [`MaybeStoppable`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Service lifecycle errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Service {name} cannot {action} while {status}")]
    InvalidState {
        name: String,
        action: &'static str,
        status: ServiceStatus,
    },

    #[error("Failed to stop {name}: {reason}")]
    StopFailed { name: String, reason: String },
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceStatus {
    Initialized = 0,
    Started = 1,
    Suspended = 2,
    Stopped = 3,
}

impl ServiceStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ServiceStatus::Started,
            2 => ServiceStatus::Suspended,
            3 => ServiceStatus::Stopped,
            _ => ServiceStatus::Initialized,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Initialized => write!(f, "initialized"),
            ServiceStatus::Started => write!(f, "started"),
            ServiceStatus::Suspended => write!(f, "suspended"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Atomic lifecycle status cell
#[derive(Debug)]
pub struct ServiceState {
    status: AtomicU8,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(ServiceStatus::Initialized as u8),
        }
    }
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ServiceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move from `from` to `to`, returning whether the transition happened
    pub fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.status() == ServiceStatus::Started
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == ServiceStatus::Suspended
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == ServiceStatus::Stopped
    }

    /// Started or suspended, i.e. not yet stopped
    pub fn is_run_allowed(&self) -> bool {
        matches!(
            self.status(),
            ServiceStatus::Started | ServiceStatus::Suspended
        )
    }
}

/// Something that can be stopped
pub trait Stoppable: Send + Sync {
    fn stop(&self) -> ServiceResult<()>;
}

/// Optional stop capability
///
/// Values stored in a stopping cache implement this; the default reports no
/// capability, so plain values are simply dropped on eviction.
pub trait MaybeStoppable {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }
}

impl<T: MaybeStoppable + ?Sized> MaybeStoppable for Arc<T> {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        (**self).as_stoppable()
    }
}

impl<T: MaybeStoppable + ?Sized> MaybeStoppable for Box<T> {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        (**self).as_stoppable()
    }
}

impl MaybeStoppable for String {}
impl MaybeStoppable for courier_schema::Value {}
