//! # txlease
//!
//! Policy-driven leasing of expensive physical connections.
//!
//! Client code asks a [`ConnectionManager`] for a logical connection. The
//! request travels down a chain of policies, each of which may hand out a
//! connection it already owns or pass the request on. Only the last link,
//! the [`TerminalPolicy`], ever asks the [`ConnectionFactory`] for a new
//! physical connection.
//!
//! ## Policies
//!
//! - [`BoundedPoolPolicy`]: global pool with a hard size limit, blocking
//!   allocation, overflow eviction of the oldest idle connection and
//!   per-connection idle timers
//! - [`ThreadScopedPolicy`]: one pool per calling thread, with
//!   snapshot/reconcile bracketing
//! - [`XaTransactionPolicy`] / [`LocalTransactionPolicy`]: one pool per
//!   ambient transaction, released when the transaction completes
//!
//! ## Example
//!
//! ```rust,ignore
//! use txlease::{ChainServices, ConnectionManager, LeaseConfig, PoolConfig, TransactionSupport};
//!
//! let config = LeaseConfig::new()
//!     .pool(PoolConfig::new().min_size(1).max_size(20))
//!     .transaction_support(TransactionSupport::Xa);
//! let services = ChainServices::new().transaction_manager(transactions);
//!
//! let manager = ConnectionManager::from_config(factory.clone(), &config, services)?;
//! let handle = manager.allocate(&factory, None)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod local;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod timer;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use config::{LeaseConfig, PoolConfig, TransactionSupport};
pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ConnectionFactory,
    LogicalHandle, ManagedConnection, PhysicalConnection, RequestContext, RequestInfo, Subject,
    dispatch_event,
};
pub use error::{Error, Result};
pub use local::LocalTransactionAdapter;
pub use manager::{ChainServices, ConnectionManager};
pub use policy::{
    BoundedPoolPolicy, ConnectionPolicy, LocalAssociation, LocalTransactionPolicy, TerminalPolicy,
    ThreadScope, ThreadScopedPolicy, TransactionAssociation, TransactionScopedPolicy,
    XaAssociation, XaTransactionPolicy,
};
pub use pool::{Pool, PoolStatus};
pub use timer::{Timer, TimerHandle, TimerTask, TokioTimer};
pub use transaction::{
    CompletionCallback, LocalTransaction, PrepareVote, Transaction, TransactionId,
    TransactionManager, TransactionStatus, XaError, XaErrorCode, XaFlags, XaResource, Xid,
};
