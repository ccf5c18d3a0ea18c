//! Scheduled executor on the tokio runtime
//!
//! Drives timer callbacks such as poll cycles and timeout map sweeps. Each
//! scheduled task runs as one tokio task; a task never overlaps with itself.
//! A run that panics is logged and the schedule carries on.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Executor errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("Executor {0} is shut down")]
    Shutdown(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// When a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Wait `delay` after each run completes
    FixedDelay {
        initial_delay: Duration,
        delay: Duration,
    },
    /// Start a run every `period`, regardless of run duration
    FixedRate {
        initial_delay: Duration,
        period: Duration,
    },
}

impl Schedule {
    pub fn initial_delay(&self) -> Duration {
        match self {
            Schedule::FixedDelay { initial_delay, .. } | Schedule::FixedRate { initial_delay, .. } => {
                *initial_delay
            }
        }
    }
}

/// Work executed on every tick
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);
}

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Cancel future runs; a run in progress is aborted at its next await point
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ExecutorInner {
    name: String,
    handle: Handle,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<TaskHandle>>,
}

/// Shared executor for periodic tasks
#[derive(Clone)]
pub struct ScheduledExecutor {
    inner: Arc<ExecutorInner>,
}

impl ScheduledExecutor {
    /// Create an executor on the current tokio runtime
    pub fn new(name: impl Into<String>) -> ExecutorResult<Self> {
        let handle = Handle::try_current().map_err(|e| ExecutorError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(name, handle))
    }

    /// Create an executor on the given runtime
    pub fn with_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                name: name.into(),
                handle,
                shutdown: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Cancel every task and refuse new ones
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        debug!(executor = %self.inner.name, tasks = tasks.len(), "Shutting down executor");
        for task in tasks {
            task.cancel();
        }
    }

    /// Schedule an async task
    pub fn schedule(
        &self,
        schedule: Schedule,
        task: Arc<dyn ScheduledTask>,
    ) -> ExecutorResult<TaskHandle> {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown(self.inner.name.clone()));
        }
        if let Schedule::FixedRate { period, .. } = schedule {
            if period.is_zero() {
                return Err(ExecutorError::InvalidSchedule(
                    "fixed rate period must be positive".to_string(),
                ));
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let name = self.inner.name.clone();
        let join = self.inner.handle.spawn(async move {
            time::sleep(schedule.initial_delay()).await;
            match schedule {
                Schedule::FixedDelay { delay, .. } => loop {
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    run_guarded(&name, task.as_ref()).await;
                    time::sleep(delay).await;
                },
                Schedule::FixedRate { period, .. } => {
                    let mut ticker = time::interval_at(Instant::now(), period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
                    loop {
                        ticker.tick().await;
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                        run_guarded(&name, task.as_ref()).await;
                    }
                }
            }
        });

        let handle = TaskHandle {
            abort: join.abort_handle(),
            cancelled,
        };
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_cancelled());
        tasks.push(handle.clone());
        Ok(handle)
    }

    /// Schedule a synchronous closure
    pub fn schedule_fn<F>(&self, schedule: Schedule, f: F) -> ExecutorResult<TaskHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule(schedule, Arc::new(FnTask(f)))
    }
}

impl fmt::Debug for ScheduledExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledExecutor")
            .field("name", &self.inner.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

async fn run_guarded(executor: &str, task: &dyn ScheduledTask) {
    if let Err(panic) = AssertUnwindSafe(task.run()).catch_unwind().await {
        error!(
            executor,
            panic = panic_message(panic.as_ref()),
            "Scheduled task panicked; it runs again at the next schedule"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

struct FnTask<F>(F);

#[async_trait]
impl<F> ScheduledTask for FnTask<F>
where
    F: Fn() + Send + Sync + 'static,
{
    async fn run(&self) {
        (self.0)()
    }
}
