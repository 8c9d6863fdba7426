//! Transaction collaborators.
//!
//! The engine does not coordinate transactions. It asks a
//! [`TransactionManager`] for the ambient [`Transaction`], enlists resources
//! with it, and registers a completion callback so it can drain the
//! transaction's pool once the coordinator is done.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::Result;

/// Identity of a transaction, used to key transaction-scoped pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Lifecycle status of a transaction as reported by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The transaction is running.
    Active,
    /// The transaction will roll back; work may still be done under it.
    MarkedRollback,
    /// Two-phase prepare is in progress.
    Preparing,
    /// All resources voted to commit.
    Prepared,
    /// Commit is in progress.
    Committing,
    /// The transaction committed.
    Committed,
    /// Rollback is in progress.
    RollingBack,
    /// The transaction rolled back.
    RolledBack,
    /// The coordinator cannot tell.
    Unknown,
    /// No transaction is associated with the caller.
    NoTransaction,
}

impl TransactionStatus {
    /// Check whether connections may still be associated with the transaction.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// Check whether the transaction has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Callback fired exactly once when a transaction finishes, with its outcome.
pub type CompletionCallback = Box<dyn FnOnce(TransactionStatus) + Send + 'static>;

/// A transaction supplied by an external coordinator.
pub trait Transaction: Send + Sync {
    /// Stable identity of this transaction.
    fn id(&self) -> TransactionId;

    /// Current status.
    fn status(&self) -> TransactionStatus;

    /// Register a resource whose commit and rollback the coordinator drives.
    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<()>;

    /// Register a callback fired after the transaction completes.
    fn register_completion(&self, callback: CompletionCallback) -> Result<()>;
}

/// Looks up the transaction associated with the calling context.
pub trait TransactionManager: Send + Sync {
    /// The ambient transaction, if any.
    fn transaction(&self) -> Option<Arc<dyn Transaction>>;
}

/// Non-distributed transaction control of one physical connection.
pub trait LocalTransaction: Send + Sync {
    /// Begin a local transaction.
    fn begin(&self) -> Result<()>;

    /// Commit the local transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the local transaction.
    fn rollback(&self) -> Result<()>;
}

/// Global transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    /// Format identifier; `-1` denotes a null XID.
    pub format_id: i32,
    /// Global transaction identifier.
    pub global_transaction_id: Vec<u8>,
    /// Branch qualifier.
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Create a branch identifier.
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }
}

/// Flags passed to [`XaResource::start`] and [`XaResource::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XaFlags {
    /// No flags.
    #[default]
    NoFlags,
    /// Join an existing branch.
    Join,
    /// Resume a suspended branch.
    Resume,
    /// Work on the branch completed successfully.
    Success,
    /// Work on the branch failed.
    Fail,
    /// Suspend the branch.
    Suspend,
}

/// Vote returned by [`XaResource::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The branch is prepared and must be committed or rolled back.
    Ok,
    /// The branch did no updates and has already been completed.
    ReadOnly,
}

/// Category of an [`XaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaErrorCode {
    /// Resource manager error.
    RmError,
    /// Routine invoked in an improper context.
    Protocol,
    /// The branch was rolled back.
    Rollback,
    /// Invalid arguments.
    InvalidArgument,
}

/// Failure reported by an [`XaResource`].
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct XaError {
    /// Error category.
    pub code: XaErrorCode,
    /// Description.
    pub message: String,
}

impl XaError {
    /// Create an XA error.
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Distributed-transaction resource enlisted with a [`Transaction`].
pub trait XaResource: Send + Sync {
    /// Start work on behalf of a branch.
    fn start(&self, xid: &Xid, flags: XaFlags) -> std::result::Result<(), XaError>;

    /// End work on behalf of a branch.
    fn end(&self, xid: &Xid, flags: XaFlags) -> std::result::Result<(), XaError>;

    /// Ask the resource to prepare the branch.
    fn prepare(&self, xid: &Xid) -> std::result::Result<PrepareVote, XaError>;

    /// Commit the branch.
    fn commit(&self, xid: &Xid, one_phase: bool) -> std::result::Result<(), XaError>;

    /// Roll back the branch.
    fn rollback(&self, xid: &Xid) -> std::result::Result<(), XaError>;

    /// Forget a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> std::result::Result<(), XaError>;

    /// Prepared or heuristically completed branches awaiting recovery.
    fn recover(&self) -> std::result::Result<Vec<Xid>, XaError>;

    /// Check whether `other` is backed by the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    /// Branch timeout in seconds.
    fn transaction_timeout(&self) -> u32 {
        0
    }

    /// Set the branch timeout; returns whether the resource accepted it.
    fn set_transaction_timeout(&self, _seconds: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accepts_work() {
        assert!(TransactionStatus::Active.accepts_work());
        assert!(TransactionStatus::MarkedRollback.accepts_work());
        assert!(!TransactionStatus::Committing.accepts_work());
        assert!(!TransactionStatus::NoTransaction.accepts_work());
    }

    #[test]
    fn test_status_completed() {
        assert!(TransactionStatus::Committed.is_completed());
        assert!(TransactionStatus::RolledBack.is_completed());
        assert!(!TransactionStatus::Prepared.is_completed());
    }

    #[test]
    fn test_xa_error_display() {
        let err = XaError::new(XaErrorCode::Protocol, "start without end");
        assert_eq!(err.to_string(), "Protocol: start without end");
    }

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(TransactionId(7).to_string(), "tx-7");
    }
}
