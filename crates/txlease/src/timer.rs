//! One-shot timers for idle eviction.
//!
//! A [`Timer`] runs a task once after a delay. Scheduling returns a
//! [`TimerHandle`] that cancels the task when dropped, so a pool entry that
//! owns its handle cannot leave the free set without disarming its timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

/// Work run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling facility for one-shot tasks.
pub trait Timer: Send + Sync {
    /// Run `task` once after `delay` unless the returned handle is dropped first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancel all outstanding tasks and refuse new ones.
    fn shutdown(&self) {}
}

/// Cancels a scheduled task when cancelled explicitly or dropped.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    /// Create a handle that runs `cancel` at most once.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    #[must_use]
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Cancel the task now.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// [`Timer`] backed by a tokio runtime.
///
/// Each scheduled task is a runtime task that sleeps and then hands the work
/// to the blocking pool. Tasks take pool locks and destroy connections, so
/// they never run on a runtime worker, and a current-thread runtime is fine.
pub struct TokioTimer {
    runtime: Handle,
    tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl TokioTimer {
    /// Create a timer that spawns onto `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a timer on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Timer(e.to_string()))
    }

    /// Number of tasks scheduled and not yet fired or cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::warn!("timer is shut down, dropping scheduled task");
            return TimerHandle::detached();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fired = Arc::clone(&self.tasks);

        // Hold the map while spawning so the task cannot deregister before it
        // has been registered.
        let mut tasks = self.tasks.lock();
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if fired.lock().remove(&id).is_none() {
                return;
            }
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                tracing::warn!(error = %e, "timer task failed");
            }
        });
        tasks.insert(id, join.abort_handle());
        drop(tasks);

        let tasks = Arc::downgrade(&self.tasks);
        TimerHandle::new(move || {
            let Some(tasks) = tasks.upgrade() else {
                return;
            };
            let removed = tasks.lock().remove(&id);
            if let Some(abort) = removed {
                abort.abort();
            }
        })
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let drained: Vec<AbortHandle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling outstanding timers");
        }
        for abort in drained {
            abort.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
