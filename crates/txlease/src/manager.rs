//! Entry point for clients requesting connections.
//!
//! A [`ConnectionManager`] owns a policy chain for one connection factory.
//! It starts out with only a [`TerminalPolicy`]; each
//! [`add_policy`](ConnectionManager::add_policy) call wraps the current head
//! in a new link. The manager also subscribes to every connection the
//! terminal creates, turning `closed` events into releases and `error`
//! events into error notifications at the head of the chain.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::config::{LeaseConfig, TransactionSupport};
use crate::connection::{
    ConnectionEvent, ConnectionEventListener, ConnectionFactory, LogicalHandle,
    PhysicalConnection, RequestContext, RequestInfo, Subject, same_factory,
};
use crate::error::{Error, Result};
use crate::policy::{
    BoundedPoolPolicy, ConnectionPolicy, LocalAssociation, LocalTransactionPolicy, TerminalPolicy,
    ThreadScopedPolicy, XaAssociation, XaTransactionPolicy, allocated, release_quietly,
};
use crate::pool::PoolStatus;
use crate::timer::{Timer, TokioTimer};
use crate::transaction::TransactionManager;

type Head = RwLock<Arc<dyn ConnectionPolicy>>;

/// Forwards connection events to the current head of the chain.
struct ChainListener {
    head: Weak<Head>,
}

impl ChainListener {
    fn head(&self) -> Option<Arc<dyn ConnectionPolicy>> {
        self.head.upgrade().map(|head| Arc::clone(&head.read()))
    }
}

impl ConnectionEventListener for ChainListener {
    fn connection_closed(&self, event: &ConnectionEvent) {
        let Some(head) = self.head() else {
            tracing::debug!(connection = %event.source, "close event after manager was dropped");
            return;
        };
        if let Err(e) = head.release(&event.source) {
            tracing::warn!(connection = %event.source, error = %e, "failed to release closed connection");
        }
    }

    fn connection_error_occurred(&self, event: &ConnectionEvent) {
        let Some(head) = self.head() else {
            tracing::debug!(connection = %event.source, "error event after manager was dropped");
            return;
        };
        tracing::debug!(
            connection = %event.source,
            cause = event.error.as_deref().unwrap_or("unknown"),
            "connection reported an error"
        );
        if let Err(e) = head.connection_error_occurred(&event.source) {
            tracing::warn!(connection = %event.source, error = %e, "failed to handle connection error");
        }
    }
}

/// Collaborators [`ConnectionManager::from_config`] may need.
#[derive(Clone, Default)]
pub struct ChainServices {
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    timer: Option<Arc<dyn Timer>>,
}

impl ChainServices {
    /// No collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction manager for `Local` and `Xa` transaction support.
    #[must_use]
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    /// Timer for idle eviction. Defaults to a [`TokioTimer`] on the current
    /// runtime when the pool has an idle timeout.
    #[must_use]
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }
}

impl fmt::Debug for ChainServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainServices")
            .field("transaction_manager", &self.transaction_manager.is_some())
            .field("timer", &self.timer.is_some())
            .finish()
    }
}

/// Hands out logical connections through a policy chain.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    head: Arc<Head>,
    pool: Option<Arc<BoundedPoolPolicy>>,
    thread_scope: Option<Arc<ThreadScopedPolicy>>,
}

impl ConnectionManager {
    /// Create a manager whose chain holds only a terminal policy.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let head: Arc<Head> = Arc::new_cyclic(|weak| {
            let listener = Arc::new(ChainListener { head: weak.clone() });
            let terminal: Arc<dyn ConnectionPolicy> = Arc::new(TerminalPolicy::new(listener));
            RwLock::new(terminal)
        });
        head.read().initialize(Some(Arc::clone(&factory)), None)?;

        Ok(Self {
            factory,
            head,
            pool: None,
            thread_scope: None,
        })
    }

    /// Build a chain from configuration values.
    ///
    /// Links are added innermost first: bounded pool, thread scope, then the
    /// transaction policy, so the transaction policy sees requests first.
    pub fn from_config(
        factory: Arc<dyn ConnectionFactory>,
        config: &LeaseConfig,
        services: ChainServices,
    ) -> Result<Self> {
        config.validate()?;
        let mut manager = Self::new(factory)?;

        if let Some(pool_config) = &config.pool {
            let mut pool = BoundedPoolPolicy::new(pool_config.clone())?;
            if let Some(timer) = services.timer.clone() {
                pool = pool.with_timer(timer);
            } else if pool_config.idle_timeout.is_some() {
                pool = pool.with_timer(Arc::new(TokioTimer::current()?));
            }
            let pool = Arc::new(pool);
            manager.add_policy(pool.clone())?;
            manager.pool = Some(pool);
        }

        if config.thread_scoped {
            let thread_scope = Arc::new(ThreadScopedPolicy::new());
            manager.add_policy(thread_scope.clone())?;
            manager.thread_scope = Some(thread_scope);
        }

        if config.transaction_support != TransactionSupport::None {
            let transactions = services.transaction_manager.clone().ok_or_else(|| {
                Error::Configuration("transaction support requires a transaction manager".into())
            })?;
            let fallthrough = config.allow_unbounded_fallthrough;
            let policy: Arc<dyn ConnectionPolicy> = match config.transaction_support {
                TransactionSupport::Xa => Arc::new(
                    XaTransactionPolicy::new(transactions, XaAssociation)
                        .allow_unbounded_fallthrough(fallthrough),
                ),
                _ => Arc::new(
                    LocalTransactionPolicy::new(transactions, LocalAssociation)
                        .allow_unbounded_fallthrough(fallthrough),
                ),
            };
            manager.add_policy(policy)?;
        }

        tracing::debug!(
            pooled = config.pool.is_some(),
            thread_scoped = config.thread_scoped,
            transactions = ?config.transaction_support,
            "built policy chain"
        );
        Ok(manager)
    }

    /// Wrap the current chain in `policy`, which becomes the new head.
    pub fn add_policy(&self, policy: Arc<dyn ConnectionPolicy>) -> Result<()> {
        let mut head = self.head.write();
        policy.initialize(Some(Arc::clone(&self.factory)), Some(Arc::clone(&head)))?;
        *head = policy;
        Ok(())
    }

    /// The current head of the chain.
    #[must_use]
    pub fn head(&self) -> Arc<dyn ConnectionPolicy> {
        Arc::clone(&self.head.read())
    }

    /// The factory this manager serves.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    /// Status of the bounded pool, if [`from_config`](Self::from_config)
    /// added one.
    #[must_use]
    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(|pool| pool.status())
    }

    /// The thread-scoped policy, if [`from_config`](Self::from_config) added
    /// one. Use it to bracket units of work.
    #[must_use]
    pub fn thread_scope(&self) -> Option<&Arc<ThreadScopedPolicy>> {
        self.thread_scope.as_ref()
    }

    /// Allocate a logical connection without a security subject.
    pub fn allocate(
        &self,
        factory: &Arc<dyn ConnectionFactory>,
        info: Option<RequestInfo>,
    ) -> Result<LogicalHandle> {
        self.allocate_for(factory, None, info)
    }

    /// Allocate a logical connection on behalf of `subject`.
    pub fn allocate_for(
        &self,
        factory: &Arc<dyn ConnectionFactory>,
        subject: Option<Subject>,
        info: Option<RequestInfo>,
    ) -> Result<LogicalHandle> {
        if !same_factory(&self.factory, factory) {
            return Err(Error::ConfigurationMismatch);
        }

        let head = self.head();
        let mut ctx = RequestContext::new(Arc::clone(factory), subject, info);
        head.allocate(&mut ctx)?;
        let conn = allocated(&ctx)?;

        ctx.logical_handle().inspect_err(|e| {
            tracing::warn!(connection = %conn, error = %e, "failed to create logical handle");
            release_quietly(head.as_ref(), &conn, "no logical handle");
        })
    }

    /// Hand a physical connection back to the chain.
    pub fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        self.head().release(conn)
    }

    /// Report a failed physical connection to the chain.
    pub fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        self.head().connection_error_occurred(conn)
    }

    /// Dispose every link, releasing all pooled connections.
    pub fn dispose(&self) -> Result<()> {
        tracing::info!("disposing connection manager");
        self.head().dispose()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pool", &self.pool_status())
            .field("thread_scoped", &self.thread_scope.is_some())
            .finish_non_exhaustive()
    }
}
