//! Global bounded pool with idle eviction.
//!
//! All callers share one [`Pool`]. At most `max_size` physical connections
//! exist at once (leased, idle, or being created). When the limit is
//! reached and nothing is idle, `allocate` blocks until a connection is
//! released. Every idle connection carries a one-shot eviction timer; when
//! it fires the connection is destroyed unless that would take the idle
//! count to `min_size` or below.
//!
//! The factory is never called while the pool lock is held. A caller that
//! needs a new connection reserves a slot (`creating`), creates the
//! connection unlocked, then records it as active.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::PoolConfig;
use crate::connection::{ConnectionFactory, PhysicalConnection, RequestContext};
use crate::error::{Error, Result};
use crate::policy::{ChainLink, ConnectionPolicy, allocated, release_quietly};
use crate::pool::{Pool, PoolStatus};
use crate::timer::{Timer, TimerHandle};

/// Size-bounded pool shared by every caller.
pub struct BoundedPoolPolicy {
    link: ChainLink,
    config: PoolConfig,
    timer: Option<Arc<dyn Timer>>,
    shared: OnceLock<Arc<Shared>>,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    pool: Pool<TimerHandle>,
    creating: usize,
    waiting: usize,
    closed: bool,
}

impl State {
    fn exhausted(&self, max: usize) -> bool {
        self.pool.free_len() == 0 && self.pool.active_len() + self.creating >= max
    }
}

impl BoundedPoolPolicy {
    /// Create a bounded pool policy. Idle eviction additionally needs a
    /// timer, see [`with_timer`](Self::with_timer).
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            link: ChainLink::new(),
            config,
            timer: None,
            shared: OnceLock::new(),
        })
    }

    /// Use `timer` to schedule idle eviction.
    #[must_use]
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let max = self.config.max_size;
        match self.shared.get() {
            Some(shared) => {
                let state = shared.state.lock();
                PoolStatus {
                    available: state.pool.free_len(),
                    in_use: state.pool.active_len(),
                    total: state.pool.size() + state.creating,
                    waiting: state.waiting,
                    max,
                }
            }
            None => PoolStatus {
                available: 0,
                in_use: 0,
                total: 0,
                waiting: 0,
                max,
            },
        }
    }

    /// Check if the pool has been disposed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared
            .get()
            .is_some_and(|shared| shared.state.lock().closed)
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        self.shared.get().ok_or(Error::NotInitialized)
    }

    /// Block until the pool has a free connection or room for a new one.
    fn wait_for_slot(&self, shared: &Shared, state: &mut MutexGuard<'_, State>) -> Result<()> {
        let max = self.config.max_size;
        let deadline = self
            .config
            .acquire_timeout
            .map(|timeout| (timeout, Instant::now() + timeout));
        let mut waited = false;

        loop {
            if state.closed {
                return Err(if waited {
                    Error::Interrupted
                } else {
                    Error::PoolClosed
                });
            }
            if !state.exhausted(max) {
                return Ok(());
            }
            if !waited {
                tracing::debug!(max, "pool exhausted, waiting for a connection");
                waited = true;
            }

            state.waiting += 1;
            let timed_out = match deadline {
                None => {
                    shared.available.wait(state);
                    None
                }
                Some((timeout, deadline)) => shared
                    .available
                    .wait_until(state, deadline)
                    .timed_out()
                    .then_some(timeout),
            };
            state.waiting -= 1;

            if let Some(timeout) = timed_out {
                if !state.closed && state.exhausted(max) {
                    return Err(Error::AcquisitionTimeout(timeout));
                }
            }
        }
    }

    /// Schedule eviction of a connection that is about to become free.
    fn arm_eviction(
        &self,
        shared: &Arc<Shared>,
        next: &Arc<dyn ConnectionPolicy>,
        conn: &PhysicalConnection,
    ) -> TimerHandle {
        let (Some(timer), Some(idle_timeout)) = (&self.timer, self.config.idle_timeout) else {
            return TimerHandle::detached();
        };

        let shared = Arc::downgrade(shared);
        let next = Arc::clone(next);
        let conn = conn.clone();
        let min_size = self.config.min_size;
        timer.schedule(
            idle_timeout,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    evict_idle(&shared, next.as_ref(), &conn, min_size);
                }
            }),
        )
    }
}

/// Eviction timer callback.
fn evict_idle(shared: &Shared, next: &dyn ConnectionPolicy, conn: &PhysicalConnection, min_size: usize) {
    let timer = {
        let mut state = shared.state.lock();
        if state.closed || state.pool.free_len() <= min_size {
            tracing::trace!(connection = %conn, min_size, "idle timer fired, keeping connection");
            return;
        }
        match state.pool.remove_free(conn) {
            Some(timer) => timer,
            None => {
                tracing::trace!(connection = %conn, "idle timer fired for a connection that is no longer free");
                return;
            }
        }
    };
    drop(timer);

    tracing::debug!(connection = %conn, "evicting idle connection");
    release_quietly(next, conn, "idle eviction");
}

impl ConnectionPolicy for BoundedPoolPolicy {
    fn initialize(
        &self,
        factory: Option<Arc<dyn ConnectionFactory>>,
        next: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<()> {
        if self.config.idle_timeout.is_some() && self.timer.is_none() {
            return Err(Error::Configuration(
                "idle_timeout requires a timer".into(),
            ));
        }
        self.link.bind(factory, next, true)?;

        let pool = Pool::new(Arc::clone(self.link.factory()?));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pool,
                creating: 0,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
        });
        self.shared
            .set(shared)
            .map_err(|_| Error::Configuration("policy is already initialized".into()))
    }

    fn allocate(&self, ctx: &mut RequestContext) -> Result<()> {
        self.link.check_factory(ctx)?;
        let next = self.link.next()?;
        let shared = self.shared()?;
        let max = self.config.max_size;

        let evicted = {
            let mut state = shared.state.lock();
            self.wait_for_slot(shared, &mut state)?;

            if let Some(conn) = state.pool.matched(ctx.subject(), ctx.info())? {
                if let Some(timer) = state.pool.move_free_to_active(&conn) {
                    timer.cancel();
                    tracing::trace!(connection = %conn, "reusing pooled connection");
                    ctx.connection = Some(conn);
                    return Ok(());
                }
            }

            let evicted = if state.pool.size() + state.creating >= max {
                state.pool.pop_oldest_free().map(|(conn, timer)| {
                    timer.cancel();
                    conn
                })
            } else {
                None
            };
            state.creating += 1;
            evicted
        };

        if let Some(conn) = evicted {
            tracing::debug!(connection = %conn, "evicting oldest free connection to make room");
            release_quietly(next.as_ref(), &conn, "overflow eviction");
        }

        let created = next.allocate(ctx).and_then(|()| allocated(ctx));

        let mut state = shared.state.lock();
        state.creating -= 1;
        match created {
            Ok(conn) if state.closed => {
                drop(state);
                ctx.connection = None;
                release_quietly(next.as_ref(), &conn, "pool closed during creation");
                Err(Error::PoolClosed)
            }
            Ok(conn) => {
                state.pool.add_active(conn);
                Ok(())
            }
            Err(e) => {
                drop(state);
                shared.available.notify_one();
                Err(e)
            }
        }
    }

    fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        let shared = self.shared()?;

        if shared.state.lock().pool.contains_free(conn) {
            tracing::warn!(connection = %conn, "connection released twice");
            return Ok(());
        }

        let reusable = match conn.cleanup() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection = %conn, error = %e, "cleanup failed, destroying connection");
                false
            }
        };

        {
            let mut state = shared.state.lock();
            if state.pool.contains_free(conn) {
                return Ok(());
            }
            if reusable
                && !state.closed
                && state.pool.free_len() < self.config.max_size
                && state.pool.contains_active(conn)
            {
                let timer = self.arm_eviction(shared, next, conn);
                state.pool.move_active_to_free(conn, timer);
                drop(state);
                shared.available.notify_one();
                return Ok(());
            }
            state.pool.remove_active(conn);
        }

        shared.available.notify_one();
        next.release(conn)
    }

    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        let shared = self.shared()?;

        let timer = {
            let mut state = shared.state.lock();
            let timer = state.pool.remove_free(conn);
            if timer.is_none() {
                state.pool.remove_active(conn);
            }
            timer
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        shared.available.notify_all();

        next.connection_error_occurred(conn)
    }

    fn dispose(&self) -> Result<()> {
        let next = self.link.next()?;
        let shared = self.shared()?;

        let mut pool = {
            let mut state = shared.state.lock();
            state.closed = true;
            let empty = Pool::new(Arc::clone(self.link.factory()?));
            std::mem::replace(&mut state.pool, empty)
        };
        shared.available.notify_all();

        tracing::info!(
            active = pool.active_len(),
            free = pool.free_len(),
            "disposing bounded pool"
        );
        pool.close_all(next.as_ref());
        if let Some(timer) = &self.timer {
            timer.shutdown();
        }
        next.dispose()
    }
}
