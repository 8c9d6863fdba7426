//! Minimal collaborators for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::connection::{
    ConnectionEvent, ConnectionEventListener, ConnectionFactory, LogicalHandle, ManagedConnection,
    PhysicalConnection, RequestContext, RequestInfo, Subject, dispatch_event,
};
use crate::error::{Error, Result};
use crate::policy::ConnectionPolicy;
use crate::transaction::{
    CompletionCallback, LocalTransaction, Transaction, TransactionId, TransactionManager,
    TransactionStatus, XaResource,
};

#[derive(Default)]
pub(crate) struct StubConnection {
    destroyed: AtomicBool,
    cleanups: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl StubConnection {
    pub(crate) fn create() -> PhysicalConnection {
        PhysicalConnection::new(Arc::new(Self::default()))
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub(crate) fn listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn fire(&self, event: &ConnectionEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            dispatch_event(listener.as_ref(), event);
        }
    }
}

impl ManagedConnection for StubConnection {
    fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connection(&self, _: Option<&Subject>, _: Option<&RequestInfo>) -> Result<LogicalHandle> {
        Ok(LogicalHandle::new(()))
    }

    fn local_transaction(&self) -> Result<Arc<dyn LocalTransaction>> {
        Err(Error::Resource("stub has no local transaction".into()))
    }

    fn xa_resource(&self) -> Result<Arc<dyn XaResource>> {
        Err(Error::Resource("stub has no XA resource".into()))
    }

    fn add_connection_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_connection_event_listener(&self, listener: &Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }
}

enum Matching {
    FirstFree,
    Always(PhysicalConnection),
}

pub(crate) struct StubFactory {
    matching: Matching,
    fail_create: bool,
    match_calls: AtomicUsize,
    created: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubFactory {
    fn with(matching: Matching) -> Self {
        Self {
            matching,
            fail_create: false,
            match_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn first_free() -> Self {
        Self::with(Matching::FirstFree)
    }

    pub(crate) fn always(conn: PhysicalConnection) -> Self {
        Self::with(Matching::Always(conn))
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub(crate) fn match_calls(&self) -> usize {
        self.match_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> usize {
        self.created.lock().len()
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn stub(&self, conn: &PhysicalConnection) -> Arc<StubConnection> {
        self.created
            .lock()
            .iter()
            .find(|s| PhysicalConnection::new(Arc::clone(s) as Arc<dyn ManagedConnection>) == *conn)
            .cloned()
            .expect("connection was not created by this factory")
    }
}

impl ConnectionFactory for StubFactory {
    fn create(&self, _: Option<&Subject>, _: Option<&RequestInfo>) -> Result<PhysicalConnection> {
        if self.fail_create {
            return Err(Error::Resource("factory is down".into()));
        }
        let stub = Arc::new(StubConnection::default());
        self.created.lock().push(Arc::clone(&stub));
        Ok(PhysicalConnection::new(stub))
    }

    fn match_connections(
        &self,
        candidates: &[PhysicalConnection],
        _: Option<&Subject>,
        _: Option<&RequestInfo>,
    ) -> Result<Option<PhysicalConnection>> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.matching {
            Matching::FirstFree => candidates.first().cloned(),
            Matching::Always(conn) => Some(conn.clone()),
        })
    }
}

/// Successor that records what it is handed.
#[derive(Default)]
pub(crate) struct RecordingPolicy {
    released: Mutex<Vec<PhysicalConnection>>,
    errored: Mutex<Vec<PhysicalConnection>>,
    fail_on: Option<PhysicalConnection>,
}

impl RecordingPolicy {
    pub(crate) fn failing_on(conn: PhysicalConnection) -> Self {
        Self {
            fail_on: Some(conn),
            ..Default::default()
        }
    }

    pub(crate) fn released(&self) -> Vec<PhysicalConnection> {
        self.released.lock().clone()
    }

    pub(crate) fn errored(&self) -> Vec<PhysicalConnection> {
        self.errored.lock().clone()
    }
}

impl ConnectionPolicy for RecordingPolicy {
    fn initialize(
        &self,
        _: Option<Arc<dyn ConnectionFactory>>,
        _: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<()> {
        Ok(())
    }

    fn allocate(&self, _: &mut RequestContext) -> Result<()> {
        Err(Error::Resource("recording policy cannot allocate".into()))
    }

    fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        self.released.lock().push(conn.clone());
        if self.fail_on.as_ref() == Some(conn) {
            return Err(Error::Resource("release failed".into()));
        }
        Ok(())
    }

    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        self.errored.lock().push(conn.clone());
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct NullListener;

impl ConnectionEventListener for NullListener {
    fn connection_closed(&self, _: &ConnectionEvent) {}

    fn connection_error_occurred(&self, _: &ConnectionEvent) {}
}

pub(crate) struct StubTransaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    enlisted: AtomicUsize,
    callbacks: Mutex<Vec<CompletionCallback>>,
    fail_register: bool,
}

impl StubTransaction {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self::with(id, false))
    }

    pub(crate) fn rejecting_callbacks(id: u64) -> Arc<Self> {
        Arc::new(Self::with(id, true))
    }

    fn with(id: u64, fail_register: bool) -> Self {
        Self {
            id: TransactionId(id),
            status: Mutex::new(TransactionStatus::Active),
            enlisted: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
            fail_register,
        }
    }

    pub(crate) fn enlisted(&self) -> usize {
        self.enlisted.load(Ordering::SeqCst)
    }

    pub(crate) fn callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn complete(&self, status: TransactionStatus) {
        self.set_status(status);
        let callbacks: Vec<CompletionCallback> = self.callbacks.lock().drain(..).collect();
        for callback in callbacks {
            callback(status);
        }
    }
}

impl Transaction for StubTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn enlist_resource(&self, _: Arc<dyn XaResource>) -> Result<()> {
        self.enlisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_completion(&self, callback: CompletionCallback) -> Result<()> {
        if self.fail_register {
            return Err(Error::Transaction("registration rejected".into()));
        }
        self.callbacks.lock().push(callback);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct StubTransactionManager {
    current: Mutex<Option<Arc<dyn Transaction>>>,
    rewrap: AtomicBool,
}

impl StubTransactionManager {
    pub(crate) fn set(&self, tx: Option<Arc<dyn Transaction>>) {
        *self.current.lock() = tx;
    }

    /// Hand out a fresh wrapper around the current transaction on every
    /// lookup, like a coordinator adapter that does not cache.
    pub(crate) fn rewrap_each_lookup(&self) {
        self.rewrap.store(true, Ordering::SeqCst);
    }
}

impl TransactionManager for StubTransactionManager {
    fn transaction(&self) -> Option<Arc<dyn Transaction>> {
        let tx = self.current.lock().clone()?;
        if self.rewrap.load(Ordering::SeqCst) {
            Some(Arc::new(Rewrapped(tx)))
        } else {
            Some(tx)
        }
    }
}

struct Rewrapped(Arc<dyn Transaction>);

impl Transaction for Rewrapped {
    fn id(&self) -> TransactionId {
        self.0.id()
    }

    fn status(&self) -> TransactionStatus {
        self.0.status()
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        self.0.enlist_resource(resource)
    }

    fn register_completion(&self, callback: CompletionCallback) -> Result<()> {
        self.0.register_completion(callback)
    }
}
