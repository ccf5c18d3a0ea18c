//! Poll schedulers
//!
//! The consumer hands its cycle to a scheduler as a [`ScheduledTask`]. The
//! default scheduler runs it on a [`ScheduledExecutor`] at a fixed delay or
//! rate, optionally as several concurrent loops sharing the same task.

use crate::consumer::ScheduledPollConsumer;
use crate::error::{SchedulerError, SchedulerResult};
use courier_core::{Schedule, ScheduledExecutor, ScheduledPollConfig, ScheduledTask, TaskHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Backend that runs a consumer's poll cycle
pub trait PollScheduler: Send + Sync {
    /// Called once when the consumer starts, before the task is scheduled
    fn on_init(&self, _consumer: &ScheduledPollConsumer) -> SchedulerResult<()> {
        Ok(())
    }

    /// Register the task to run; nothing runs until the scheduler is started
    fn schedule_task(&self, task: Arc<dyn ScheduledTask>) -> SchedulerResult<()>;

    /// Start running the scheduled task
    fn start_scheduler(&self) -> SchedulerResult<()>;

    /// Stop running and forget the task
    fn unschedule_task(&self);

    fn is_scheduler_started(&self) -> bool;
}

/// Scheduler on a shared executor
pub struct DefaultPollScheduler {
    executor: ScheduledExecutor,
    schedule: Schedule,
    concurrent_tasks: usize,
    task: Mutex<Option<Arc<dyn ScheduledTask>>>,
    handles: Mutex<Vec<TaskHandle>>,
}

impl DefaultPollScheduler {
    pub fn new(executor: ScheduledExecutor, schedule: Schedule) -> Self {
        Self {
            executor,
            schedule,
            concurrent_tasks: 1,
            task: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Build a scheduler from consumer settings
    pub fn from_config(executor: ScheduledExecutor, config: &ScheduledPollConfig) -> Self {
        let schedule = if config.use_fixed_delay {
            Schedule::FixedDelay {
                initial_delay: config.initial_delay(),
                delay: config.delay(),
            }
        } else {
            Schedule::FixedRate {
                initial_delay: config.initial_delay(),
                period: config.delay(),
            }
        };
        Self::new(executor, schedule).with_concurrent_tasks(config.concurrent_consumers)
    }

    /// Run the task as `n` concurrent loops
    pub fn with_concurrent_tasks(mut self, n: usize) -> Self {
        self.concurrent_tasks = n.max(1);
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn concurrent_tasks(&self) -> usize {
        self.concurrent_tasks
    }
}

impl PollScheduler for DefaultPollScheduler {
    fn schedule_task(&self, task: Arc<dyn ScheduledTask>) -> SchedulerResult<()> {
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn start_scheduler(&self) -> SchedulerResult<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }
        let task = self.task.lock().clone().ok_or(SchedulerError::NoTask)?;

        for _ in 0..self.concurrent_tasks {
            match self.executor.schedule(self.schedule, Arc::clone(&task)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles.drain(..) {
                        handle.cancel();
                    }
                    return Err(e.into());
                }
            }
        }
        debug!(
            executor = self.executor.name(),
            tasks = self.concurrent_tasks,
            schedule = ?self.schedule,
            "Poll scheduler started"
        );
        Ok(())
    }

    fn unschedule_task(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.cancel();
        }
        self.task.lock().take();
        if !handles.is_empty() {
            debug!(executor = self.executor.name(), "Poll scheduler stopped");
        }
    }

    fn is_scheduler_started(&self) -> bool {
        !self.handles.lock().is_empty()
    }
}

impl fmt::Debug for DefaultPollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultPollScheduler")
            .field("executor", &self.executor.name())
            .field("schedule", &self.schedule)
            .field("concurrent_tasks", &self.concurrent_tasks)
            .field("started", &self.is_scheduler_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ScheduledTask for Counting {
        async fn run(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_tasks_share_one_task() {
        let executor = ScheduledExecutor::new("poll").unwrap();
        let scheduler = DefaultPollScheduler::new(
            executor,
            Schedule::FixedDelay {
                initial_delay: Duration::from_millis(10),
                delay: Duration::from_millis(100),
            },
        )
        .with_concurrent_tasks(3);

        let task = Arc::new(Counting(AtomicUsize::new(0)));
        scheduler.schedule_task(task.clone()).unwrap();
        assert!(!scheduler.is_scheduler_started());

        scheduler.start_scheduler().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 3);

        scheduler.unschedule_task();
        assert!(!scheduler.is_scheduler_started());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_start_without_task_fails() {
        let executor = ScheduledExecutor::new("poll").unwrap();
        let scheduler = DefaultPollScheduler::from_config(executor, &ScheduledPollConfig::default());
        assert_eq!(scheduler.start_scheduler(), Err(SchedulerError::NoTask));
        assert!(matches!(scheduler.schedule(), Schedule::FixedDelay { .. }));
    }
}
