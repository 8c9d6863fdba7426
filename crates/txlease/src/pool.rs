//! Per-scope connection bookkeeping.
//!
//! A [`Pool`] tracks the physical connections owned by one scope instance
//! (the global pool, one thread, or one transaction). Each connection is
//! either *active* (leased to a caller) or *free* (idle and reusable), never
//! both. Free entries carry a scope-specific value `T`, such as the
//! eviction timer of the bounded pool, and are kept in least-recently-used
//! order so the oldest entry can be evicted first.

use std::collections::HashSet;
use std::sync::Arc;

use lru::LruCache;

use crate::connection::{ConnectionFactory, PhysicalConnection, RequestInfo, Subject};
use crate::error::Result;
use crate::policy::ConnectionPolicy;

/// Active and free connections of one scope.
pub struct Pool<T = ()> {
    factory: Arc<dyn ConnectionFactory>,
    active: HashSet<PhysicalConnection>,
    free: LruCache<PhysicalConnection, T>,
}

impl<T> Pool<T> {
    /// Create an empty pool that matches through `factory`.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            active: HashSet::new(),
            free: LruCache::unbounded(),
        }
    }

    /// Ask the factory's matcher for a free connection that can serve the
    /// request.
    ///
    /// The matcher is not called when nothing is free. A result that is not
    /// currently free is reported as a miss.
    pub fn matched(
        &self,
        subject: Option<&Subject>,
        info: Option<&RequestInfo>,
    ) -> Result<Option<PhysicalConnection>> {
        if self.free.is_empty() {
            return Ok(None);
        }

        let candidates: Vec<PhysicalConnection> =
            self.free.iter().rev().map(|(conn, _)| conn.clone()).collect();
        match self.factory.match_connections(&candidates, subject, info)? {
            Some(conn) if self.free.contains(&conn) => {
                tracing::trace!(connection = %conn, "matched free connection");
                Ok(Some(conn))
            }
            Some(conn) => {
                tracing::warn!(connection = %conn, "matcher returned a connection that is not free");
                Ok(None)
            }
            None => {
                tracing::trace!(free = candidates.len(), "no free connection matched");
                Ok(None)
            }
        }
    }

    /// Record a newly leased connection.
    pub fn add_active(&mut self, conn: PhysicalConnection) {
        debug_assert!(!self.free.contains(&conn));
        self.active.insert(conn);
    }

    /// Record an idle connection as the most recently used free entry.
    pub fn add_free(&mut self, conn: PhysicalConnection, value: T) {
        debug_assert!(!self.active.contains(&conn));
        self.free.put(conn, value);
    }

    /// Lease a free connection. Returns its free-entry value, or `None` if
    /// the connection was not free.
    pub fn move_free_to_active(&mut self, conn: &PhysicalConnection) -> Option<T> {
        let value = self.free.pop(conn)?;
        self.active.insert(conn.clone());
        Some(value)
    }

    /// Return a leased connection to the free set. Returns `false` (and drops
    /// `value`) if the connection was not active.
    pub fn move_active_to_free(&mut self, conn: &PhysicalConnection, value: T) -> bool {
        if !self.active.remove(conn) {
            return false;
        }
        self.free.put(conn.clone(), value);
        true
    }

    /// Forget a free connection, returning its entry value.
    pub fn remove_free(&mut self, conn: &PhysicalConnection) -> Option<T> {
        self.free.pop(conn)
    }

    /// Forget an active connection.
    pub fn remove_active(&mut self, conn: &PhysicalConnection) -> bool {
        self.active.remove(conn)
    }

    /// Remove the least recently used free entry.
    pub fn pop_oldest_free(&mut self) -> Option<(PhysicalConnection, T)> {
        self.free.pop_lru()
    }

    /// Check whether a connection is leased from this pool.
    #[must_use]
    pub fn contains_active(&self, conn: &PhysicalConnection) -> bool {
        self.active.contains(conn)
    }

    /// Check whether a connection is idle in this pool.
    #[must_use]
    pub fn contains_free(&self, conn: &PhysicalConnection) -> bool {
        self.free.contains(conn)
    }

    /// Number of leased connections.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Number of idle connections.
    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Total number of connections owned by this pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.active.len() + self.free.len()
    }

    /// Check whether the pool owns no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Every connection owned by this pool, active or free.
    #[must_use]
    pub fn connections(&self) -> HashSet<PhysicalConnection> {
        self.active
            .iter()
            .cloned()
            .chain(self.free.iter().map(|(conn, _)| conn.clone()))
            .collect()
    }

    /// Remove every connection, active first, then free from oldest to newest.
    pub fn drain(&mut self) -> Vec<PhysicalConnection> {
        let mut drained: Vec<PhysicalConnection> = self.active.drain().collect();
        while let Some((conn, _)) = self.free.pop_lru() {
            drained.push(conn);
        }
        drained
    }

    /// Drain the pool, releasing every connection through `next`.
    ///
    /// Failures are logged and do not stop the remaining releases.
    pub fn close_all(&mut self, next: &dyn ConnectionPolicy) {
        release_all(next, self.drain());
    }
}

/// Release drained connections through `next`, logging failures.
///
/// Call this after dropping whatever lock guarded the pool they came from,
/// since a release may re-enter the chain through a connection event.
pub fn release_all(next: &dyn ConnectionPolicy, connections: Vec<PhysicalConnection>) {
    for conn in connections {
        if let Err(e) = next.release(&conn) {
            tracing::warn!(connection = %conn, error = %e, "failed to release pooled connection");
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("active", &self.active.len())
            .field("free", &self.free.len())
            .finish()
    }
}

/// Status information about a bounded pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Total number of connections, including ones being created.
    pub total: usize,
    /// Number of callers blocked waiting for a connection.
    pub waiting: usize,
    /// Maximum allowed connections.
    pub max: usize,
}
