//! Physical connections and the collaborators that create them.
//!
//! The engine never speaks a wire protocol itself. A [`ConnectionFactory`]
//! creates [`ManagedConnection`]s, and the engine only tracks which scope
//! currently owns each one. Connections are compared by identity: two
//! [`PhysicalConnection`] values are equal when they point at the same
//! underlying connection object.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Result;
use crate::transaction::{LocalTransaction, XaResource};

macro_rules! opaque_value {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn Any + Send + Sync>);

        impl $name {
            /// Wrap an arbitrary value.
            pub fn new<T: Any + Send + Sync>(value: T) -> Self {
                Self(Arc::new(value))
            }

            /// Borrow the wrapped value if it has type `T`.
            #[must_use]
            pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
                self.0.downcast_ref::<T>()
            }

            /// Check whether two values share the same allocation.
            #[must_use]
            pub fn ptr_eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

opaque_value!(
    /// Opaque security principal the caller allocates on behalf of.
    Subject
);

opaque_value!(
    /// Opaque, factory-specific request parameters.
    ///
    /// Only the factory's matcher and the physical connection interpret it.
    RequestInfo
);

opaque_value!(
    /// Lightweight client-facing handle obtained from a physical connection.
    LogicalHandle
);

/// Factory that creates physical connections and matches them for reuse.
pub trait ConnectionFactory: Send + Sync {
    /// Create a brand-new physical connection.
    fn create(
        &self,
        subject: Option<&Subject>,
        info: Option<&RequestInfo>,
    ) -> Result<PhysicalConnection>;

    /// Pick a candidate that can serve the given request, if any.
    ///
    /// Candidates are the free connections of one pool. Returning a
    /// connection that is not among them is treated as a miss.
    fn match_connections(
        &self,
        candidates: &[PhysicalConnection],
        subject: Option<&Subject>,
        info: Option<&RequestInfo>,
    ) -> Result<Option<PhysicalConnection>>;
}

/// Check whether two factory references point at the same factory.
#[must_use]
pub fn same_factory(a: &Arc<dyn ConnectionFactory>, b: &Arc<dyn ConnectionFactory>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units.
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A real, expensive-to-create connection supplied by a factory.
///
/// All methods take `&self` because a connection is shared between the pool
/// that owns it and the listener callbacks it fires; implementations use
/// interior mutability.
pub trait ManagedConnection: Send + Sync {
    /// Reset connection-local state before the connection is pooled again.
    fn cleanup(&self) -> Result<()>;

    /// Close the connection for good.
    fn destroy(&self) -> Result<()>;

    /// Produce a client-facing handle.
    fn connection(
        &self,
        subject: Option<&Subject>,
        info: Option<&RequestInfo>,
    ) -> Result<LogicalHandle>;

    /// The connection's non-distributed transaction control.
    fn local_transaction(&self) -> Result<Arc<dyn LocalTransaction>>;

    /// The connection's distributed-transaction resource.
    fn xa_resource(&self) -> Result<Arc<dyn XaResource>>;

    /// Subscribe to `closed` and `error` events.
    fn add_connection_event_listener(&self, listener: Arc<dyn ConnectionEventListener>);

    /// Unsubscribe a listener previously added.
    fn remove_connection_event_listener(&self, listener: &Arc<dyn ConnectionEventListener>);
}

/// Identity-comparable handle to a [`ManagedConnection`].
#[derive(Clone)]
pub struct PhysicalConnection(Arc<dyn ManagedConnection>);

impl PhysicalConnection {
    /// Wrap a managed connection.
    pub fn new(inner: Arc<dyn ManagedConnection>) -> Self {
        Self(inner)
    }

    /// Address of the underlying connection, stable for its lifetime.
    #[must_use]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    /// Borrow the underlying connection.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn ManagedConnection> {
        &self.0
    }
}

impl std::ops::Deref for PhysicalConnection {
    type Target = dyn ManagedConnection;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for PhysicalConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for PhysicalConnection {}

impl Hash for PhysicalConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalConnection({:#x})", self.id())
    }
}

impl fmt::Display for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.id())
    }
}

/// Kind of event a physical connection reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// The client closed its logical handle.
    Closed,
    /// The connection failed and must not be reused.
    ErrorOccurred,
    /// A local transaction began on the connection.
    LocalTransactionStarted,
    /// A local transaction committed.
    LocalTransactionCommitted,
    /// A local transaction rolled back.
    LocalTransactionRolledBack,
}

/// Event delivered to a [`ConnectionEventListener`].
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Connection that fired the event.
    pub source: PhysicalConnection,
    /// What happened.
    pub kind: ConnectionEventKind,
    /// Logical handle involved, when the connection knows it.
    pub handle: Option<LogicalHandle>,
    /// Driver-supplied error description for `ErrorOccurred`.
    pub error: Option<String>,
}

impl ConnectionEvent {
    /// Create an event without a handle or error detail.
    #[must_use]
    pub fn new(source: PhysicalConnection, kind: ConnectionEventKind) -> Self {
        Self {
            source,
            kind,
            handle: None,
            error: None,
        }
    }

    /// Attach the logical handle that triggered the event.
    #[must_use]
    pub fn with_handle(mut self, handle: LogicalHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Attach an error description.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Receiver of asynchronous events from physical connections.
///
/// Events arrive on driver threads with no caller to report failures to,
/// so implementations must not panic.
pub trait ConnectionEventListener: Send + Sync {
    /// A logical handle was closed by the client.
    fn connection_closed(&self, event: &ConnectionEvent);

    /// The connection failed.
    fn connection_error_occurred(&self, event: &ConnectionEvent);

    /// A local transaction began.
    fn local_transaction_started(&self, _event: &ConnectionEvent) {}

    /// A local transaction committed.
    fn local_transaction_committed(&self, _event: &ConnectionEvent) {}

    /// A local transaction rolled back.
    fn local_transaction_rolled_back(&self, _event: &ConnectionEvent) {}
}

/// Route an event to the matching listener method.
pub fn dispatch_event(listener: &dyn ConnectionEventListener, event: &ConnectionEvent) {
    match event.kind {
        ConnectionEventKind::Closed => listener.connection_closed(event),
        ConnectionEventKind::ErrorOccurred => listener.connection_error_occurred(event),
        ConnectionEventKind::LocalTransactionStarted => listener.local_transaction_started(event),
        ConnectionEventKind::LocalTransactionCommitted => {
            listener.local_transaction_committed(event);
        }
        ConnectionEventKind::LocalTransactionRolledBack => {
            listener.local_transaction_rolled_back(event);
        }
    }
}

/// State of one allocation request as it travels down the policy chain.
pub struct RequestContext {
    subject: Option<Subject>,
    info: Option<RequestInfo>,
    factory: Arc<dyn ConnectionFactory>,
    /// Physical connection chosen by whichever link satisfied the request.
    pub connection: Option<PhysicalConnection>,
    /// Logical handle, if a link already produced one.
    pub handle: Option<LogicalHandle>,
}

impl RequestContext {
    /// Create a context for a request against `factory`.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        subject: Option<Subject>,
        info: Option<RequestInfo>,
    ) -> Self {
        Self {
            subject,
            info,
            factory,
            connection: None,
            handle: None,
        }
    }

    /// Security principal of the request.
    #[must_use]
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Request parameters.
    #[must_use]
    pub fn info(&self) -> Option<&RequestInfo> {
        self.info.as_ref()
    }

    /// Factory the request targets.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    /// Take the produced handle, or ask the connection for a fresh one.
    pub fn logical_handle(&mut self) -> Result<LogicalHandle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| crate::Error::Resource("no connection was allocated".into()))?;
        let handle = connection.connection(self.subject.as_ref(), self.info.as_ref())?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("subject", &self.subject)
            .field("info", &self.info)
            .field("connection", &self.connection)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_util::StubConnection;

    #[test]
    fn test_opaque_downcast() {
        let info = RequestInfo::new(String::from("reader"));
        assert_eq!(info.downcast_ref::<String>().unwrap(), "reader");
        assert!(info.downcast_ref::<u32>().is_none());

        let copy = info.clone();
        assert!(copy.ptr_eq(&info));
        assert!(!RequestInfo::new(String::from("reader")).ptr_eq(&info));
    }

    #[test]
    fn test_connection_identity() {
        let a = StubConnection::create();
        let b = StubConnection::create();

        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_event_builder() {
        let conn = StubConnection::create();
        let event = ConnectionEvent::new(conn.clone(), ConnectionEventKind::ErrorOccurred)
            .with_error("socket reset");

        assert_eq!(event.source, conn);
        assert_eq!(event.error.as_deref(), Some("socket reset"));
        assert!(event.handle.is_none());
    }
}
