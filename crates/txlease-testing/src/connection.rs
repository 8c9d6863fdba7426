//! Mock connection factory and physical connections.
//!
//! Every mock connection carries a *key*, taken from the [`RequestInfo`] it
//! was created for (see [`request`]). The factory's matcher only reuses a
//! candidate whose key equals the request's key, so tests can force hits and
//! misses by choosing keys.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use txlease::{
    ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ConnectionFactory, Error,
    LocalTransaction, LogicalHandle, ManagedConnection, PhysicalConnection, RequestInfo, Result,
    Subject, XaResource, dispatch_event,
};

use crate::transaction::{MockLocalTransaction, MockXaResource};

/// Request info carrying a matching key.
#[must_use]
pub fn request(key: &str) -> RequestInfo {
    RequestInfo::new(key.to_owned())
}

fn key_of(info: Option<&RequestInfo>) -> &str {
    info.and_then(|info| info.downcast_ref::<String>())
        .map_or("", String::as_str)
}

/// Logical handle handed out by a [`MockConnection`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    /// Physical connection the handle belongs to.
    pub connection: PhysicalConnection,
    /// Sequence number of the handle on its connection.
    pub serial: usize,
}

/// The physical connection behind a handle produced by a mock connection.
#[must_use]
pub fn physical(handle: &LogicalHandle) -> Option<PhysicalConnection> {
    handle
        .downcast_ref::<MockHandle>()
        .map(|handle| handle.connection.clone())
}

/// Physical connection double.
pub struct MockConnection {
    this: Weak<MockConnection>,
    key: String,
    destroyed: AtomicBool,
    fail_cleanup: AtomicBool,
    cleanups: AtomicUsize,
    handles: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    local: Arc<MockLocalTransaction>,
    xa: Arc<MockXaResource>,
}

impl MockConnection {
    /// Create a connection with the given matching key.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        let key = key.into();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key,
            destroyed: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
            handles: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            local: Arc::new(MockLocalTransaction::default()),
            xa: Arc::new(MockXaResource::default()),
        })
    }

    /// Identity handle of this connection.
    #[must_use]
    pub fn physical(self: &Arc<Self>) -> PhysicalConnection {
        PhysicalConnection::new(Arc::clone(self) as Arc<dyn ManagedConnection>)
    }

    /// Matching key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check whether the connection has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of `cleanup` calls so far.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Number of logical handles handed out.
    #[must_use]
    pub fn handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    /// Number of subscribed listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Make subsequent `cleanup` calls fail.
    pub fn fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    /// The connection's local transaction double.
    #[must_use]
    pub fn local(&self) -> &Arc<MockLocalTransaction> {
        &self.local
    }

    /// The connection's XA resource double.
    #[must_use]
    pub fn xa(&self) -> &Arc<MockXaResource> {
        &self.xa
    }

    /// Notify listeners that the client closed its handle.
    pub fn fire_closed(self: &Arc<Self>) {
        self.fire(&ConnectionEvent::new(self.physical(), ConnectionEventKind::Closed));
    }

    /// Notify listeners that the connection failed.
    pub fn fire_error(self: &Arc<Self>, cause: &str) {
        self.fire(
            &ConnectionEvent::new(self.physical(), ConnectionEventKind::ErrorOccurred)
                .with_error(cause),
        );
    }

    fn fire(&self, event: &ConnectionEvent) {
        // Listeners may unsubscribe while handling the event.
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            dispatch_event(listener.as_ref(), event);
        }
    }
}

impl ManagedConnection for MockConnection {
    fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Error::Resource(format!("cleanup of {} failed", self.key)));
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        tracing::trace!(key = %self.key, "mock connection destroyed");
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connection(&self, _: Option<&Subject>, _: Option<&RequestInfo>) -> Result<LogicalHandle> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Resource("connection is gone".into()))?;
        let serial = self.handles.fetch_add(1, Ordering::SeqCst);
        Ok(LogicalHandle::new(MockHandle {
            connection: this.physical(),
            serial,
        }))
    }

    fn local_transaction(&self) -> Result<Arc<dyn LocalTransaction>> {
        Ok(self.local.clone())
    }

    fn xa_resource(&self) -> Result<Arc<dyn XaResource>> {
        Ok(self.xa.clone())
    }

    fn add_connection_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().push(listener);
    }

    fn remove_connection_event_listener(&self, listener: &Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }
}

/// Connection factory double.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
    match_calls: AtomicUsize,
    fail_create: AtomicBool,
}

impl MockFactory {
    /// Create a factory with no connections.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// This factory as the trait object the engine expects.
    #[must_use]
    pub fn as_factory(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
        Arc::clone(self) as Arc<dyn ConnectionFactory>
    }

    /// Make subsequent `create` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of connections created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Number of matcher invocations so far.
    #[must_use]
    pub fn match_calls(&self) -> usize {
        self.match_calls.load(Ordering::SeqCst)
    }

    /// The `n`th connection created, starting at zero.
    #[must_use]
    pub fn nth(&self, n: usize) -> Option<Arc<MockConnection>> {
        self.created.lock().get(n).cloned()
    }

    /// The mock behind a physical connection created by this factory.
    #[must_use]
    pub fn mock(&self, conn: &PhysicalConnection) -> Option<Arc<MockConnection>> {
        self.created
            .lock()
            .iter()
            .find(|mock| mock.physical() == *conn)
            .cloned()
    }

    /// Number of created connections that have not been destroyed.
    #[must_use]
    pub fn live(&self) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|mock| !mock.is_destroyed())
            .count()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, _: Option<&Subject>, info: Option<&RequestInfo>) -> Result<PhysicalConnection> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Resource("mock factory refused to connect".into()));
        }
        let mock = MockConnection::new(key_of(info));
        self.created.lock().push(Arc::clone(&mock));
        Ok(mock.physical())
    }

    fn match_connections(
        &self,
        candidates: &[PhysicalConnection],
        _: Option<&Subject>,
        info: Option<&RequestInfo>,
    ) -> Result<Option<PhysicalConnection>> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        let key = key_of(info);
        Ok(candidates
            .iter()
            .find(|conn| self.mock(conn).is_some_and(|mock| mock.key() == key))
            .cloned())
    }
}
