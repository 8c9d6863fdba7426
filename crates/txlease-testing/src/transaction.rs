//! Mock transaction coordinator and transactional resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use txlease::{
    CompletionCallback, Error, LocalTransaction, PrepareVote, Result, Transaction, TransactionId,
    TransactionManager, TransactionStatus, XaError, XaFlags, XaResource, Xid,
};

/// Transaction double that completes when the test says so.
pub struct MockTransaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    enlisted: Mutex<Vec<Arc<dyn XaResource>>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    fail_enlist: AtomicBool,
}

impl MockTransaction {
    /// Create an active transaction.
    #[must_use]
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId(id),
            status: Mutex::new(TransactionStatus::Active),
            enlisted: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            fail_enlist: AtomicBool::new(false),
        })
    }

    /// Resources enlisted so far.
    #[must_use]
    pub fn enlisted(&self) -> Vec<Arc<dyn XaResource>> {
        self.enlisted.lock().clone()
    }

    /// Number of completion callbacks waiting to fire.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Make subsequent enlistments fail.
    pub fn fail_enlist(&self, fail: bool) {
        self.fail_enlist.store(fail, Ordering::SeqCst);
    }

    /// Change the status without completing.
    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    /// Finish the transaction and fire every completion callback once.
    pub fn complete(&self, status: TransactionStatus) {
        self.set_status(status);
        let callbacks: Vec<CompletionCallback> = self.callbacks.lock().drain(..).collect();
        tracing::debug!(transaction = %self.id, ?status, callbacks = callbacks.len(), "mock transaction completed");
        for callback in callbacks {
            callback(status);
        }
    }
}

impl Transaction for MockTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        if self.fail_enlist.load(Ordering::SeqCst) {
            return Err(Error::Transaction(format!("{} refused enlistment", self.id)));
        }
        self.enlisted.lock().push(resource);
        Ok(())
    }

    fn register_completion(&self, callback: CompletionCallback) -> Result<()> {
        let status = self.status();
        if status.is_completed() {
            return Err(Error::Transaction(format!("{} already completed", self.id)));
        }
        self.callbacks.lock().push(callback);
        Ok(())
    }
}

/// Coordinator double with one ambient transaction per thread.
#[derive(Default)]
pub struct MockTransactionManager {
    current: Mutex<HashMap<ThreadId, Arc<MockTransaction>>>,
}

impl MockTransactionManager {
    /// Create a coordinator with no transactions.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// This coordinator as the trait object the engine expects.
    #[must_use]
    pub fn as_manager(self: &Arc<Self>) -> Arc<dyn TransactionManager> {
        Arc::clone(self) as Arc<dyn TransactionManager>
    }

    /// Make `tx` the calling thread's ambient transaction.
    pub fn begin(&self, tx: &Arc<MockTransaction>) {
        self.current
            .lock()
            .insert(thread::current().id(), Arc::clone(tx));
    }

    /// Disassociate the calling thread from its transaction.
    pub fn suspend(&self) -> Option<Arc<MockTransaction>> {
        self.current.lock().remove(&thread::current().id())
    }
}

impl TransactionManager for MockTransactionManager {
    fn transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.current
            .lock()
            .get(&thread::current().id())
            .map(|tx| Arc::clone(tx) as Arc<dyn Transaction>)
    }
}

/// Local transaction double counting its calls.
#[derive(Default)]
pub struct MockLocalTransaction {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail: AtomicBool,
}

impl MockLocalTransaction {
    /// Number of `begin` calls.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    /// Number of `commit` calls.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of `rollback` calls.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn count(&self, counter: &AtomicUsize, op: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Resource(format!("local {op} failed")));
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl LocalTransaction for MockLocalTransaction {
    fn begin(&self) -> Result<()> {
        self.count(&self.begins, "begin")
    }

    fn commit(&self) -> Result<()> {
        self.count(&self.commits, "commit")
    }

    fn rollback(&self) -> Result<()> {
        self.count(&self.rollbacks, "rollback")
    }
}

/// XA resource double recording the calls it receives.
#[derive(Default)]
pub struct MockXaResource {
    calls: Mutex<Vec<&'static str>>,
}

impl MockXaResource {
    /// Names of the calls received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

impl XaResource for MockXaResource {
    fn start(&self, _: &Xid, _: XaFlags) -> std::result::Result<(), XaError> {
        self.record("start");
        Ok(())
    }

    fn end(&self, _: &Xid, _: XaFlags) -> std::result::Result<(), XaError> {
        self.record("end");
        Ok(())
    }

    fn prepare(&self, _: &Xid) -> std::result::Result<PrepareVote, XaError> {
        self.record("prepare");
        Ok(PrepareVote::Ok)
    }

    fn commit(&self, _: &Xid, _: bool) -> std::result::Result<(), XaError> {
        self.record("commit");
        Ok(())
    }

    fn rollback(&self, _: &Xid) -> std::result::Result<(), XaError> {
        self.record("rollback");
        Ok(())
    }

    fn forget(&self, _: &Xid) -> std::result::Result<(), XaError> {
        self.record("forget");
        Ok(())
    }

    fn recover(&self) -> std::result::Result<Vec<Xid>, XaError> {
        self.record("recover");
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn XaResource)
    }
}
