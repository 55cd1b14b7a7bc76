//! Main-loop attachment.
//!
//! The core does not multiplex I/O itself; a [`MainLoop`] implementation
//! wires a freshly constructed connection into whatever event loop the
//! surrounding system runs. Construction fails with
//! [`Error::NoMainLoop`](crate::Error::NoMainLoop) unless a main loop is
//! supplied explicitly or a process-wide default has been configured.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use crate::connection::Connection;
use crate::dispatch::DispatchResult;
use crate::error::Result;
use crate::registry;

/// Hook that attaches a connection to an event loop.
pub trait MainLoop: Send + Sync {
    /// Attach `conn`. A failure aborts the construction that requested
    /// the attachment.
    fn attach(&self, conn: &Arc<Connection>) -> Result<MainLoopBinding>;
}

/// The owned result of a main-loop attachment.
///
/// Dropping the binding detaches the connection.
pub struct MainLoopBinding {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl MainLoopBinding {
    /// A binding that runs `detach` when dropped.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A binding with nothing to detach.
    pub fn unbound() -> Self {
        Self { detach: None }
    }
}

impl Drop for MainLoopBinding {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for MainLoopBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoopBinding")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

// Unset until the surrounding system configures it.
static DEFAULT_MAIN_LOOP: RwLock<Option<Arc<dyn MainLoop>>> = RwLock::new(None);

/// Configure or clear the process-wide default main loop.
pub fn set_default(mainloop: Option<Arc<dyn MainLoop>>) {
    *DEFAULT_MAIN_LOOP
        .write()
        .unwrap_or_else(PoisonError::into_inner) = mainloop;
}

/// The process-wide default main loop, if one has been configured.
pub fn default() -> Option<Arc<dyn MainLoop>> {
    DEFAULT_MAIN_LOOP
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Main loop that dispatches inbound messages on the transport's own
/// delivery thread.
///
/// Attaching registers a trampoline as the transport's message callback:
/// the trampoline recovers the owning connection from the registry and
/// runs [`Connection::dispatch_message`], returning the tri-state result
/// to the transport. Detaching clears the callback.
pub struct InlineMainLoop;

impl MainLoop for InlineMainLoop {
    fn attach(&self, conn: &Arc<Connection>) -> Result<MainLoopBinding> {
        let handle = conn.handle()?;
        debug!(handle = handle.id(), "attaching connection inline");
        handle.set_message_callback(Some(Arc::new(|id, msg| {
            match registry::lookup_existing(id) {
                Ok(conn) => conn.dispatch_message(msg),
                Err(err) => {
                    // Delivery for a dead connection; nothing to route to.
                    error!(handle = id, error = %err, "dropping message for unknown connection");
                    DispatchResult::NotYetHandled
                }
            }
        })));
        let weak_handle = Arc::downgrade(&handle);
        Ok(MainLoopBinding::new(move || {
            if let Some(handle) = weak_handle.upgrade() {
                handle.set_message_callback(None);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_binding_detaches_on_drop() {
        let detached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&detached);
        let binding = MainLoopBinding::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!detached.load(Ordering::SeqCst));
        drop(binding);
        assert!(detached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unbound_binding_is_inert() {
        drop(MainLoopBinding::unbound());
    }

    #[test]
    fn test_inline_attach_installs_and_removes_callback() {
        let transport = MemoryTransport::new();
        let conn =
            Connection::new_consuming(transport.clone(), Some(Arc::new(InlineMainLoop)))
                .unwrap();
        assert!(transport.has_message_callback());

        conn.close();
        assert!(!transport.has_message_callback());
    }
}
