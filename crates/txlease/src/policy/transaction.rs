//! Transaction-scoped connection caching.
//!
//! While a transaction is active, every connection leased under it is kept
//! in a pool owned by that transaction. Releasing one only makes it free for
//! the next request in the same transaction; nothing is handed back down the
//! chain until the coordinator reports completion. This keeps all work of a
//! transaction on the connections that were enlisted with it.
//!
//! How a new connection joins the transaction is the job of a
//! [`TransactionAssociation`]: [`XaAssociation`] enlists the connection's
//! distributed resource, [`LocalAssociation`] wraps its local transaction in
//! a [`LocalTransactionAdapter`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionFactory, PhysicalConnection, RequestContext};
use crate::error::{Error, Result};
use crate::local::LocalTransactionAdapter;
use crate::policy::{ChainLink, ConnectionPolicy, allocated, release_quietly};
use crate::pool::{Pool, release_all};
use crate::transaction::{
    CompletionCallback, Transaction, TransactionId, TransactionManager, TransactionStatus,
};

/// Joins a freshly allocated connection to a transaction.
pub trait TransactionAssociation: Send + Sync + 'static {
    /// Associate `ctx.connection` with `tx`.
    fn associate(&self, tx: &dyn Transaction, ctx: &mut RequestContext) -> Result<()>;
}

/// Enlists the connection's [`XaResource`](crate::transaction::XaResource).
#[derive(Debug, Default, Clone, Copy)]
pub struct XaAssociation;

impl TransactionAssociation for XaAssociation {
    fn associate(&self, tx: &dyn Transaction, ctx: &mut RequestContext) -> Result<()> {
        let conn = allocated(ctx)?;
        tx.enlist_resource(conn.xa_resource()?)
    }
}

/// Enlists the connection's local transaction through a
/// [`LocalTransactionAdapter`].
///
/// The logical handle is produced before enlisting, since some drivers only
/// expose the local transaction once a handle exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAssociation;

impl TransactionAssociation for LocalAssociation {
    fn associate(&self, tx: &dyn Transaction, ctx: &mut RequestContext) -> Result<()> {
        if ctx.handle.is_none() {
            ctx.logical_handle()?;
        }
        let conn = allocated(ctx)?;
        let adapter = LocalTransactionAdapter::new(conn.local_transaction()?);
        tx.enlist_resource(Arc::new(adapter))
    }
}

/// Transaction policy that enlists distributed resources.
pub type XaTransactionPolicy = TransactionScopedPolicy<XaAssociation>;

/// Transaction policy that enlists local transactions.
pub type LocalTransactionPolicy = TransactionScopedPolicy<LocalAssociation>;

struct TxEntry {
    transaction: Arc<dyn Transaction>,
    pool: Pool,
    completion_registered: bool,
    // Set once the pool has been drained down the chain.
    closed: bool,
}

impl TxEntry {
    fn owns(&self, conn: &PhysicalConnection) -> bool {
        self.pool.contains_active(conn) || self.pool.contains_free(conn)
    }

    /// Whether the coordinator is done with the transaction, so no
    /// completion callback will arrive for this pool any more.
    fn finished(&self) -> bool {
        let status = self.transaction.status();
        status.is_completed()
            || matches!(status, TransactionStatus::NoTransaction | TransactionStatus::Unknown)
    }

    /// Mark the entry closed and hand back its connections. The caller
    /// releases them once the entry lock is dropped.
    fn close(&mut self) -> Vec<PhysicalConnection> {
        self.closed = true;
        self.pool.drain()
    }
}

/// Close `entry` and release its connections outside the entry lock.
fn close_entry(entry: &Entry, next: &dyn ConnectionPolicy) {
    let drained = entry.lock().close();
    release_all(next, drained);
}

type Entry = Arc<Mutex<TxEntry>>;
type TxMap = Mutex<HashMap<TransactionId, Entry>>;

/// Caches connections per ambient transaction.
pub struct TransactionScopedPolicy<A> {
    link: ChainLink,
    manager: Arc<dyn TransactionManager>,
    allow_unbounded_fallthrough: bool,
    association: A,
    pools: Arc<TxMap>,
}

impl<A: TransactionAssociation> TransactionScopedPolicy<A> {
    /// Create an unbound policy that asks `manager` for the ambient
    /// transaction.
    pub fn new(manager: Arc<dyn TransactionManager>, association: A) -> Self {
        Self {
            link: ChainLink::new(),
            manager,
            allow_unbounded_fallthrough: false,
            association,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pass requests made outside a transaction down the chain instead of
    /// failing them.
    #[must_use]
    pub fn allow_unbounded_fallthrough(mut self, allow: bool) -> Self {
        self.allow_unbounded_fallthrough = allow;
        self
    }

    /// Check whether requests outside a transaction fall through.
    #[must_use]
    pub fn allows_unbounded_fallthrough(&self) -> bool {
        self.allow_unbounded_fallthrough
    }

    /// Number of transactions that currently own a pool.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Drain the pools of transactions the coordinator reports as finished
    /// although their completion callback never fired. Returns how many
    /// pools were reaped.
    pub fn reap_orphans(&self) -> Result<usize> {
        let next = self.link.next()?;
        let orphans: Vec<(TransactionId, Entry)> = {
            let mut pools = self.pools.lock();
            let ids: Vec<TransactionId> = pools
                .iter()
                .filter(|(_, entry)| entry.lock().finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pools.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in &orphans {
            tracing::warn!(transaction = %id, "reaping pool of finished transaction");
            close_entry(entry, next.as_ref());
        }
        Ok(orphans.len())
    }

    /// The caller's transaction, if it can still take on work.
    fn ambient(&self) -> Option<Arc<dyn Transaction>> {
        self.manager
            .transaction()
            .filter(|tx| tx.status().accepts_work())
    }

    fn entry_or_create(
        &self,
        tx: &Arc<dyn Transaction>,
        factory: &Arc<dyn ConnectionFactory>,
    ) -> Entry {
        let mut created = false;
        let entry = self
            .pools
            .lock()
            .entry(tx.id())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(TxEntry {
                    transaction: Arc::clone(tx),
                    pool: Pool::new(Arc::clone(factory)),
                    completion_registered: false,
                    closed: false,
                }))
            })
            .clone();

        if created {
            tracing::debug!(transaction = %tx.id(), "created transaction pool");
            if let Err(e) = self.reap_orphans() {
                tracing::warn!(error = %e, "failed to reap finished transaction pools");
            }
        }
        entry
    }

    /// Find the pool holding `conn`, preferring the ambient transaction.
    fn owning_entry(&self, conn: &PhysicalConnection) -> Option<Entry> {
        let ambient = self.manager.transaction().map(|tx| tx.id());
        let pools = self.pools.lock();
        ambient
            .and_then(|id| pools.get(&id))
            .filter(|entry| entry.lock().owns(conn))
            .or_else(|| pools.values().find(|entry| entry.lock().owns(conn)))
            .cloned()
    }

    fn completion(&self, id: TransactionId) -> Result<CompletionCallback> {
        let pools = Arc::downgrade(&self.pools);
        let next = Arc::clone(self.link.next()?);
        Ok(Box::new(move |status: TransactionStatus| {
            let Some(pools) = pools.upgrade() else {
                return;
            };
            let entry = pools.lock().remove(&id);
            if let Some(entry) = entry {
                let drained = entry.lock().close();
                tracing::debug!(
                    transaction = %id,
                    ?status,
                    connections = drained.len(),
                    "transaction completed, releasing its connections"
                );
                release_all(next.as_ref(), drained);
            }
        }))
    }

    /// Forget a pool that never got a connection or a completion callback.
    fn discard_if_unused(&self, id: TransactionId, entry: &Entry) {
        let mut pools = self.pools.lock();
        let unused = {
            let entry = entry.lock();
            !entry.completion_registered && entry.pool.is_empty()
        };
        if unused && pools.get(&id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            pools.remove(&id);
        }
    }

    /// Undo a pool whose completion callback could not be registered.
    fn abandon(&self, id: TransactionId, entry: &Entry, next: &dyn ConnectionPolicy) {
        let mut pools = self.pools.lock();
        if pools.get(&id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            pools.remove(&id);
        }
        drop(pools);
        close_entry(entry, next);
    }
}

impl<A: TransactionAssociation> ConnectionPolicy for TransactionScopedPolicy<A> {
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

        let Some(tx) = self.ambient() else {
            if self.allow_unbounded_fallthrough {
                tracing::trace!("no ambient transaction, allocating unscoped");
                return next.allocate(ctx);
            }
            return Err(Error::NoAmbientTransaction);
        };
        let id = tx.id();
        let entry = self.entry_or_create(&tx, self.link.factory()?);

        {
            let mut entry = entry.lock();
            if !entry.closed {
                if let Some(conn) = entry.pool.matched(ctx.subject(), ctx.info())? {
                    entry.pool.move_free_to_active(&conn);
                    tracing::trace!(transaction = %id, connection = %conn, "reusing enlisted connection");
                    ctx.connection = Some(conn);
                    return Ok(());
                }
            }
        }

        next.allocate(ctx)?;
        let conn = allocated(ctx)?;
        if let Err(e) = self.association.associate(tx.as_ref(), ctx) {
            tracing::warn!(transaction = %id, connection = %conn, error = %e, "failed to associate connection");
            ctx.connection = None;
            ctx.handle = None;
            release_quietly(next.as_ref(), &conn, "association failed");
            self.discard_if_unused(id, &entry);
            return Err(e);
        }

        let register = {
            let mut entry = entry.lock();
            if entry.closed {
                drop(entry);
                ctx.connection = None;
                ctx.handle = None;
                release_quietly(next.as_ref(), &conn, "transaction completed");
                return Err(Error::Transaction(format!(
                    "{id} completed while a connection was being allocated"
                )));
            }
            entry.pool.add_active(conn.clone());
            !std::mem::replace(&mut entry.completion_registered, true)
        };
        tracing::debug!(transaction = %id, connection = %conn, "connection enlisted");

        // The callback may fire synchronously, so no entry lock is held here.
        if register {
            if let Err(e) = tx.register_completion(self.completion(id)?) {
                tracing::warn!(transaction = %id, error = %e, "failed to register completion callback");
                ctx.connection = None;
                ctx.handle = None;
                self.abandon(id, &entry, next.as_ref());
                return Err(e);
            }
        }
        Ok(())
    }

    fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        if let Some(entry) = self.owning_entry(conn) {
            let mut entry = entry.lock();
            if entry.pool.move_active_to_free(conn, ()) {
                tracing::trace!(connection = %conn, "connection kept for its transaction");
                return Ok(());
            }
            if entry.pool.contains_free(conn) {
                tracing::warn!(connection = %conn, "connection released twice");
                return Ok(());
            }
            if entry.closed {
                // Completion already handed it down.
                return Ok(());
            }
        }
        next.release(conn)
    }

    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        let next = self.link.next()?;
        if let Some(entry) = self.owning_entry(conn) {
            let mut entry = entry.lock();
            if !entry.pool.remove_active(conn) {
                entry.pool.remove_free(conn);
            }
        }
        next.connection_error_occurred(conn)
    }

    fn dispose(&self) -> Result<()> {
        let next = self.link.next()?;
        let entries: Vec<Entry> = self.pools.lock().drain().map(|(_, entry)| entry).collect();
        tracing::info!(transactions = entries.len(), "disposing transaction pools");
        for entry in &entries {
            close_entry(entry, next.as_ref());
        }
        next.dispose()
    }
}
