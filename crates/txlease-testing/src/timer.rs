//! Deterministic timer driven by the test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use txlease::{Timer, TimerHandle, TimerTask};

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    // Keyed by (due time, schedule order) so ties fire in schedule order.
    tasks: BTreeMap<(Duration, u64), TimerTask>,
    shut_down: bool,
}

/// [`Timer`] on a virtual clock that only moves on [`advance`](Self::advance).
#[derive(Clone, Default)]
pub struct ManualTimer {
    clock: Arc<Mutex<Clock>>,
}

impl ManualTimer {
    /// Create a timer at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed so far.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Number of tasks scheduled and not yet fired or cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.clock.lock().tasks.len()
    }

    /// Move the clock forward, firing every task that falls due on the way.
    ///
    /// Tasks run without the clock locked, so they may schedule or cancel
    /// other tasks.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.lock().now + by;
        loop {
            let due = {
                let mut clock = self.clock.lock();
                let key = clock.tasks.keys().next().copied().filter(|(at, _)| *at <= target);
                match key {
                    Some(key) => {
                        clock.now = key.0;
                        clock.tasks.remove(&key)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };
            match due {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let mut clock = self.clock.lock();
        if clock.shut_down {
            return TimerHandle::detached();
        }
        let key = (clock.now + delay, clock.next_id);
        clock.next_id += 1;
        clock.tasks.insert(key, task);
        drop(clock);

        let weak = Arc::downgrade(&self.clock);
        TimerHandle::new(move || {
            if let Some(clock) = weak.upgrade() {
                // Dropped outside the lock: a task may own handles of its own.
                let removed = clock.lock().tasks.remove(&key);
                drop(removed);
            }
        })
    }

    fn shutdown(&self) {
        let mut clock = self.clock.lock();
        clock.shut_down = true;
        let cancelled = std::mem::take(&mut clock.tasks);
        drop(clock);
        drop(cancelled);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fires_only_when_due() {
        let timer = ManualTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let _handle = timer.schedule(Duration::from_secs(3), counting(&fired));

        timer.advance(Duration::from_secs(2));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_cancelled_task_never_fires() {
        let timer = ManualTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timer
            .schedule(Duration::from_secs(1), counting(&fired))
            .cancel();

        timer.advance(Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drops_everything() {
        let timer = ManualTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let _a = timer.schedule(Duration::from_secs(1), counting(&fired));
        timer.shutdown();
        let _b = timer.schedule(Duration::from_secs(1), counting(&fired));

        timer.advance(Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.pending(), 0);
    }
}
