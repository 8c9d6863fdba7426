//! Tail of every policy chain.

use std::sync::Arc;

use crate::connection::{ConnectionEventListener, ConnectionFactory, PhysicalConnection, RequestContext};
use crate::error::Result;
use crate::policy::{ChainLink, ConnectionPolicy};

/// Creates a new physical connection for every allocation and destroys
/// every connection it is handed back.
pub struct TerminalPolicy {
    link: ChainLink,
    listener: Arc<dyn ConnectionEventListener>,
}

impl TerminalPolicy {
    /// Create a terminal policy that subscribes `listener` to every
    /// connection it creates.
    pub fn new(listener: Arc<dyn ConnectionEventListener>) -> Self {
        Self {
            link: ChainLink::new(),
            listener,
        }
    }

    fn destroy(&self, conn: &PhysicalConnection) -> Result<()> {
        conn.remove_connection_event_listener(&self.listener);
        tracing::debug!(connection = %conn, "destroying physical connection");
        conn.destroy()
    }
}

impl ConnectionPolicy for TerminalPolicy {
    fn initialize(
        &self,
        factory: Option<Arc<dyn ConnectionFactory>>,
        next: Option<Arc<dyn ConnectionPolicy>>,
    ) -> Result<()> {
        self.link.bind(factory, next, false)
    }

    fn allocate(&self, ctx: &mut RequestContext) -> Result<()> {
        self.link.check_factory(ctx)?;
        let conn = self.link.factory()?.create(ctx.subject(), ctx.info())?;
        conn.add_connection_event_listener(Arc::clone(&self.listener));
        tracing::debug!(connection = %conn, "created physical connection");
        ctx.connection = Some(conn);
        Ok(())
    }

    fn release(&self, conn: &PhysicalConnection) -> Result<()> {
        self.destroy(conn)
    }

    fn connection_error_occurred(&self, conn: &PhysicalConnection) -> Result<()> {
        self.destroy(conn)
    }

    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
