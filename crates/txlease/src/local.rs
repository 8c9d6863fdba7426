//! Local transaction adapter.
//!
//! Presents a connection's single non-distributed transaction as an
//! [`XaResource`] so a coordinator can drive it like any other enlisted
//! resource. The coordinator must treat it as the only non-XA participant:
//! `prepare` cannot really prepare anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::transaction::{LocalTransaction, PrepareVote, XaError, XaErrorCode, XaFlags, XaResource, Xid};

/// [`XaResource`] facade over a [`LocalTransaction`].
pub struct LocalTransactionAdapter {
    local: Arc<dyn LocalTransaction>,
    read_only: AtomicBool,
    in_progress: AtomicBool,
}

impl LocalTransactionAdapter {
    /// Wrap a connection's local transaction control.
    pub fn new(local: Arc<dyn LocalTransaction>) -> Self {
        Self {
            local,
            read_only: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Mark the branch read-only so `prepare` votes [`PrepareVote::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Check whether the branch is marked read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Check whether a local transaction has begun and not yet completed.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

fn rm_error(op: &str, err: crate::Error) -> XaError {
    XaError::new(XaErrorCode::RmError, format!("local transaction {op} failed: {err}"))
}

impl XaResource for LocalTransactionAdapter {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        if matches!(flags, XaFlags::Join | XaFlags::Resume) {
            // Already running under this branch.
            return Ok(());
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(XaError::new(
                XaErrorCode::Protocol,
                "local transaction already in progress",
            ));
        }
        tracing::trace!(format_id = xid.format_id, "beginning local transaction");
        self.local.begin().map_err(|e| {
            self.in_progress.store(false, Ordering::Release);
            rm_error("begin", e)
        })
    }

    fn end(&self, _xid: &Xid, _flags: XaFlags) -> Result<(), XaError> {
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> Result<PrepareVote, XaError> {
        if self.is_read_only() {
            Ok(PrepareVote::ReadOnly)
        } else {
            Ok(PrepareVote::Ok)
        }
    }

    fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
        tracing::trace!(format_id = xid.format_id, "committing local transaction");
        let result = self.local.commit().map_err(|e| rm_error("commit", e));
        self.in_progress.store(false, Ordering::Release);
        result
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        tracing::trace!(format_id = xid.format_id, "rolling back local transaction");
        let result = self.local.rollback().map_err(|e| rm_error("rollback", e));
        self.in_progress.store(false, Ordering::Release);
        result
    }

    fn forget(&self, _xid: &Xid) -> Result<(), XaError> {
        Ok(())
    }

    fn recover(&self) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn XaResource)
    }
}
