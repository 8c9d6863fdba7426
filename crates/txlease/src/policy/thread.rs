//! Per-thread connection caching.
//!
//! Each calling thread gets its own [`Pool`]. A connection released on the
//! thread that leased it stays reserved for that thread; anything else is
//! passed down the chain. Pools live in a map keyed by [`ThreadId`] and are
//! only ever touched by their owning thread, except for error purging and
//! disposal.
//!
//! The bracketing API lets an interceptor wrap a unit of work:
//!
//! ```rust,ignore
//! let before = policy.snapshot();
//! run_unit_of_work()?;
//! policy.reconcile(&before)?; // releases whatever the work leaked
//! ```
//!
//! [`ThreadScopedPolicy::enter`] does the same with an RAII guard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::connection::{ConnectionFactory, PhysicalConnection, RequestContext};
use crate::error::Result;
use crate::policy::{ChainLink, ConnectionPolicy, allocated};
use crate::pool::{Pool, release_all};

type ThreadPool = Arc<Mutex<Pool>>;

/// Caches connections per calling thread.
#[derive(Default)]
pub struct ThreadScopedPolicy {
    link: ChainLink,
    pools: Mutex<HashMap<ThreadId, ThreadPool>>,
}

impl ThreadScopedPolicy {
    /// Create an unbound thread-scoped policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current_pool(&self) -> Option<ThreadPool> {
        self.pools.lock().get(&thread::current().id()).cloned()
    }

    fn current_pool_or_create(&self, factory: &Arc<dyn ConnectionFactory>) -> ThreadPool {
        self.pools
            .lock()
            .entry(thread::current().id())
            .or_insert_with(|| Arc::new(Mutex::new(Pool::new(Arc::clone(factory)))))
            .clone()
    }

    /// Connections the calling thread currently holds, leased or idle.
    #[must_use]
    pub fn snapshot(&self) -> HashSet<PhysicalConnection> {
        self.current_pool()
            .map(|pool| pool.lock().connections())
            .unwrap_or_default()
    }

    /// Release every connection the calling thread acquired since `snapshot`.
    ///
    /// Connections present in `snapshot` are left alone. All leaked
    /// connections are released even if some releases fail; the first
    /// failure is returned.
    pub fn reconcile(&self, snapshot: &HashSet<PhysicalConnection>) -> Result<()> {
        let next = self.link.next()?;
        let Some(pool) = self.current_pool() else {
            return Ok(());
        };

        let leaked: Vec<PhysicalConnection> = {
            let mut pool = pool.lock();
            let leaked: Vec<PhysicalConnection> =
                pool.connections().difference(snapshot).cloned().collect();
            for conn in &leaked {
                if !pool.remove_active(conn) {
                    pool.remove_free(conn);
                }
            }
            leaked
        };

        if !leaked.is_empty() {
            tracing::debug!(count = leaked.len(), "releasing connections acquired in scope");
        }
        let mut first_error = None;
        for conn in leaked {
            if let Err(e) = next.release(&conn) {
                tracing::warn!(connection = %conn, error = %e, "failed to release scoped connection");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Open a scope that reconciles when dropped.
    #[must_use = "the scope reconciles when it is dropped"]
    pub fn enter(&self) -> ThreadScope<'_> {
        ThreadScope {
            policy: self,
            snapshot: self.snapshot(),
        }
    }

    /// Release every connection held by the calling thread and forget its
    /// pool. Call when a worker thread exits.
    pub fn end_thread(&self) -> Result<()> {
        let next = self.link.next()?;
        let pool = self.pools.lock().remove(&thread::current().id());
        if let Some(pool) = pool {
            let drained = pool.lock().drain();
            release_all(next.as_ref(), drained);
        }
        Ok(())
    }

    /// Remove `conn` from whichever thread's pool holds it.
    fn forget(&self, conn: &PhysicalConnection) -> bool {
        // Events usually arrive on a driver thread, so look everywhere.
        let pools: Vec<ThreadPool> = self.pools.lock().values().cloned().collect();
        pools.iter().any(|pool| {
            let mut pool = pool.lock();
            pool.remove_active(conn) || pool.remove_free(conn).is_some()
        })
    }

    /// Number of threads that currently have a pool.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.pools.lock().len()
    }
}

impl ConnectionPolicy for ThreadScopedPolicy {
    fn initialize(
        &self,
        factory: Option<Arc<dyn ConnectionFactory>>,
        next: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<()> {
        self.link.bind(factory, next, true)
    }

    fn allocate(&self, ctx: &mut RequestContext) -> Result<()> {
        self.link.check_factory(ctx)?;
        let next = self.link.next()?;
        let pool = self.current_pool_or_create(self.link.factory()?);

        {
            let mut pool = pool.lock();
            if let Some(conn) = pool.matched(ctx.subject(), ctx.info())? {
                pool.move_free_to_active(&conn);
                tracing::trace!(connection = %conn, "reusing thread-scoped connection");
                ctx.connection = Some(conn);
                return Ok(());
            }
        }

        next.allocate(ctx)?;
        pool.lock().add_active(allocated(ctx)?);
        Ok(())
    }

    fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        if let Some(pool) = self.current_pool() {
            let mut pool = pool.lock();
            if pool.move_active_to_free(conn, ()) {
                return Ok(());
            }
            if pool.contains_free(conn) {
                tracing::warn!(connection = %conn, "connection released twice");
                return Ok(());
            }
        }
        if self.forget(conn) {
            tracing::debug!(connection = %conn, "released on a foreign thread, passing down");
        }
        next.release(conn)
    }

    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        self.forget(conn);
        next.connection_error_occurred(conn)
    }

    fn dispose(&self) -> Result<()> {
        let next = self.link.next()?;
        let pools: Vec<ThreadPool> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        tracing::info!(threads = pools.len(), "disposing thread-scoped pools");
        for pool in pools {
            let drained = pool.lock().drain();
            release_all(next.as_ref(), drained);
        }
        next.dispose()
    }
}

/// Guard returned by [`ThreadScopedPolicy::enter`].
///
/// On drop, releases every connection the thread acquired while the guard
/// was alive and has not released since.
pub struct ThreadScope<'a> {
    policy: &'a ThreadScopedPolicy,
    snapshot: HashSet<PhysicalConnection>,
}

impl ThreadScope<'_> {
    /// Connections held when the scope was entered.
    #[must_use]
    pub fn snapshot(&self) -> &HashSet<PhysicalConnection> {
        &self.snapshot
    }
}

impl Drop for ThreadScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.policy.reconcile(&self.snapshot) {
            tracing::warn!(error = %e, "failed to reconcile thread scope");
        }
    }
}
