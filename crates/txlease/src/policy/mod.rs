//! Connection-management policies.
//!
//! A policy chain is an ordered list of [`ConnectionPolicy`] links. Every
//! request enters at the head and travels towards the [`TerminalPolicy`],
//! which talks to the connection factory. Any link may satisfy a request
//! itself (for instance by handing out a pooled connection) instead of
//! passing it on.
//!
//! ```text
//! ConnectionManager -> TransactionScoped -> ThreadScoped -> BoundedPool -> Terminal -> factory
//! ```

use std::sync::{Arc, OnceLock};

use crate::connection::{ConnectionFactory, PhysicalConnection, RequestContext, same_factory};
use crate::error::{Error, Result};

pub mod bounded;
pub mod terminal;
pub mod thread;
pub mod transaction;

pub use bounded::BoundedPoolPolicy;
pub use terminal::TerminalPolicy;
pub use thread::{ThreadScope, ThreadScopedPolicy};
pub use transaction::{
    LocalAssociation, LocalTransactionPolicy, TransactionAssociation, TransactionScopedPolicy,
    XaAssociation, XaTransactionPolicy,
};

/// One link of a policy chain.
pub trait ConnectionPolicy: Send + Sync {
    /// Bind the link to its factory and successor. May only be called once.
    fn initialize(
        &self,
        factory: Option<Arc<dyn ConnectionFactory>>,
        next: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<()>;

    /// Populate `ctx.connection`, either from state this link owns or by
    /// delegating to the successor.
    fn allocate(&self, ctx: &mut RequestContext) -> Result<()>;

    /// Take a connection back from a caller.
    fn release(&self, conn: &PhysicalConnection) -> Result<()>;

    /// Forget a failed connection, then pass the error down so it is
    /// destroyed.
    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()>;

    /// Release everything this link owns, then dispose the successor.
    fn dispose(&self) -> Result<()>;
}

struct Binding {
    factory: Arc<dyn ConnectionFactory>,
    next: Option<Arc<dyn ConnectionPolicy>>,
}

/// Factory and successor of a chain link, set once by `initialize`.
#[derive(Default)]
pub struct ChainLink {
    binding: OnceLock<Binding>,
}

impl ChainLink {
    /// Create an unbound link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            binding: OnceLock::new(),
        }
    }

    /// Bind the factory and, when `needs_next` is set, a successor.
    pub fn bind(
        &self,
        factory: Option<Arc<dyn ConnectionFactory>>,
        next: Option<Arc<dyn ConnectionPolicy>>,
        needs_next: bool,
    ) -> Result<()> {
        let factory = factory.ok_or_else(|| {
            Error::Configuration("policy requires a connection factory".into())
        })?;
        if needs_next && next.is_none() {
            return Err(Error::Configuration(
                "policy requires a next policy in the chain".into(),
            ));
        }
        if !needs_next && next.is_some() {
            return Err(Error::Configuration(
                "terminal policy cannot have a next policy".into(),
            ));
        }
        self.binding
            .set(Binding { factory, next })
            .map_err(|_| Error::Configuration("policy is already initialized".into()))
    }

    /// Check whether `bind` has succeeded.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    /// The bound factory.
    pub fn factory(&self) -> Result<&Arc<dyn ConnectionFactory>> {
        self.binding
            .get()
            .map(|b| &b.factory)
            .ok_or(Error::NotInitialized)
    }

    /// The successor link.
    pub fn next(&self) -> Result<&Arc<dyn ConnectionPolicy>> {
        self.binding
            .get()
            .and_then(|b| b.next.as_ref())
            .ok_or(Error::NotInitialized)
    }

    /// Reject requests addressed to a different factory.
    pub fn check_factory(&self, ctx: &RequestContext) -> Result<()> {
        if same_factory(self.factory()?, ctx.factory()) {
            Ok(())
        } else {
            Err(Error::ConfigurationMismatch)
        }
    }
}

/// Take the connection a successor placed in `ctx`.
pub(crate) fn allocated(ctx: &RequestContext) -> Result<PhysicalConnection> {
    ctx.connection
        .clone()
        .ok_or_else(|| Error::Resource("next policy produced no connection".into()))
}

/// Release a connection down the chain, logging instead of failing.
pub(crate) fn release_quietly(next: &dyn ConnectionPolicy, conn: &PhysicalConnection, why: &str) {
    if let Err(e) = next.release(conn) {
        tracing::warn!(connection = %conn, error = %e, "failed to release connection ({why})");
    }
}
