//! Task Scheduler
//!
//! A single background timeline executing time-triggered work: transaction
//! timeouts, phase-2 retries, pool maintenance and periodic recovery.
//!
//! # Timeline
//!
//! ```text
//! schedule(at, task) ──► BTreeMap<(at, seq), task> ──► timeline loop
//!                                 ▲                      │ sleep until first key
//! cancel(handle) ─────────────────┘                      │ pop every due task
//!                                                        ▼ execute in order
//! ```
//!
//! Tasks with equal deadlines run in insertion order. A failing or panicking
//! task is logged and the timeline carries on.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, TmError};

/// Time-triggered unit of work
#[async_trait]
pub trait Task: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    async fn execute(&self) -> Result<(), TmError>;
}

/// Cancellation handle returned by [`TaskScheduler::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    at: Instant,
    seq: u64,
}

impl TaskHandle {
    pub fn execution_time(&self) -> Instant {
        self.at
    }
}

type TimelineKey = (Instant, u64);

struct SchedulerInner {
    tasks: Mutex<BTreeMap<TimelineKey, Box<dyn Task>>>,
    wakeup: Notify,
    running: AtomicBool,
    next_seq: AtomicU64,
    timeline: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, BTreeMap<TimelineKey, Box<dyn Task>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove every task due at `now`, returning them in execution order
    /// together with the next deadline left on the timeline.
    fn take_due(&self, now: Instant) -> (Vec<Box<dyn Task>>, Option<Instant>) {
        let mut tasks = self.lock_tasks();
        let pending = tasks.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut *tasks, pending);
        let next = tasks.keys().next().map(|(at, _)| *at);
        (due.into_values().collect(), next)
    }
}

/// Cloneable handle to the shared timeline
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Spawn the timeline on the current tokio runtime.
    ///
    /// This is the only way to obtain a running scheduler; once shut down a
    /// scheduler stays stopped.
    pub fn start() -> Self {
        let inner = Arc::new(SchedulerInner {
            tasks: Mutex::new(BTreeMap::new()),
            wakeup: Notify::new(),
            running: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            timeline: Mutex::new(None),
        });

        let handle = tokio::spawn(run_timeline(inner.clone()));
        *inner.timeline.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Task scheduler started");
        Self { inner }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting on the timeline
    pub fn scheduled_count(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    pub fn schedule(&self, at: Instant, task: Box<dyn Task>) -> Result<TaskHandle, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::Stopped);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let handle = TaskHandle { at, seq };
        debug!(task = %task.describe(), seq, "Task scheduled");

        {
            let mut tasks = self.inner.lock_tasks();
            // Re-check under the lock so shutdown never leaves a task behind
            if !self.is_running() {
                return Err(SchedulerError::Stopped);
            }
            tasks.insert((at, seq), task);
        }
        self.inner.wakeup.notify_one();

        Ok(handle)
    }

    pub fn schedule_in(
        &self,
        delay: Duration,
        task: Box<dyn Task>,
    ) -> Result<TaskHandle, SchedulerError> {
        self.schedule(Instant::now() + delay, task)
    }

    /// Remove a task that has not started yet.
    ///
    /// Returns `false` if the task already ran, was already cancelled or the
    /// scheduler is stopped.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let removed = self
            .inner
            .lock_tasks()
            .remove(&(handle.at, handle.seq))
            .is_some();
        if removed {
            debug!(seq = handle.seq, "Task cancelled");
            self.inner.wakeup.notify_one();
        }
        removed
    }

    /// Stop the timeline and wait for it to exit. Pending tasks are dropped.
    ///
    /// Only the first call stops anything; later calls return `false`.
    /// Must not be awaited from inside a task running on this scheduler.
    pub async fn shutdown(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Task scheduler already stopped");
            return false;
        }

        let dropped = {
            let mut tasks = self.inner.lock_tasks();
            let count = tasks.len();
            tasks.clear();
            count
        };
        self.inner.wakeup.notify_one();

        let handle = self
            .inner
            .timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Task scheduler timeline ended abnormally");
        }

        info!(dropped_tasks = dropped, "Task scheduler stopped");
        true
    }
}

async fn run_timeline(inner: Arc<SchedulerInner>) {
    debug!("Task scheduler timeline running");

    while inner.running.load(Ordering::SeqCst) {
        let (due, next) = inner.take_due(Instant::now());

        if due.is_empty() {
            match next {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = inner.wakeup.notified() => {}
                    }
                }
                None => inner.wakeup.notified().await,
            }
            continue;
        }

        for task in due {
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
            execute(task.as_ref()).await;
        }
    }

    debug!("Task scheduler timeline exited");
}

async fn execute(task: &dyn Task) {
    let description = task.describe();
    debug!(task = %description, "Executing task");

    match AssertUnwindSafe(task.execute()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = %description, error = %e, "Task failed"),
        Err(_) => error!(task = %description, "Task panicked"),
    }
}
