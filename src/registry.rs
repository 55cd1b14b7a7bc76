//! Process-wide association between transport handles and connections.
//!
//! Asynchronous callback trampolines receive only a bare transport-handle
//! identity; this table recovers the owning [`Connection`] from it. The
//! associations are weak: the registry is a lookup aid, never an
//! ownership edge, so it can never keep a Connection alive after the
//! surrounding system drops its last reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::transport::HandleId;

static REGISTRY: OnceLock<Mutex<HashMap<HandleId, Weak<Connection>>>> = OnceLock::new();

fn entries() -> &'static Mutex<HashMap<HandleId, Weak<Connection>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Install a weak association from `id` to `conn`.
///
/// Fails with [`Error::AlreadyAssociated`] if the handle already has a
/// live association. The check and the insert happen under one lock, so a
/// handle is never observable in a half-installed state.
pub fn install(id: HandleId, conn: &Arc<Connection>) -> Result<()> {
    let mut entries = entries().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = entries.get(&id) {
        if existing.upgrade().is_some() {
            return Err(Error::AlreadyAssociated(id));
        }
        // A dead entry is left over from a wrapper that never ran its
        // teardown; the slot can be reused.
    }
    entries.insert(id, Arc::downgrade(conn));
    debug!(handle = id, "installed connection association");
    Ok(())
}

/// Resolve a handle identity to its owning connection.
///
/// Fails with [`Error::NotAssociated`] if no association exists or the
/// association has been invalidated. Callers treat this as a fatal
/// consistency error: the transport delivered a callback for a connection
/// that no longer exists at the wrapper level.
pub fn lookup_existing(id: HandleId) -> Result<Arc<Connection>> {
    entries()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .and_then(Weak::upgrade)
        .ok_or(Error::NotAssociated(id))
}

/// Whether `id` currently has a live association.
pub fn is_associated(id: HandleId) -> bool {
    entries()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .is_some_and(|weak| weak.upgrade().is_some())
}

/// Invalidate the association for `id`, if any.
pub fn remove(id: HandleId) {
    let removed = entries()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
        .is_some();
    if removed {
        debug!(handle = id, "removed connection association");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::InlineMainLoop;
    use crate::transport::{MemoryTransport, Transport};

    fn test_conn() -> (Arc<MemoryTransport>, Arc<Connection>) {
        let transport = MemoryTransport::new();
        let conn =
            Connection::new_consuming(transport.clone(), Some(Arc::new(InlineMainLoop)))
                .unwrap();
        (transport, conn)
    }

    #[test]
    fn test_install_then_lookup_returns_connection() {
        // Construction installs the association.
        let (transport, conn) = test_conn();
        let found = lookup_existing(transport.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
    }

    #[test]
    fn test_second_install_fails() {
        let (transport, conn) = test_conn();
        let err = install(transport.id(), &conn).unwrap_err();
        assert!(matches!(err, Error::AlreadyAssociated(id) if id == transport.id()));
    }

    #[test]
    fn test_lookup_after_teardown_is_not_associated() {
        let (transport, conn) = test_conn();
        let id = transport.id();
        drop(conn);
        let err = lookup_existing(id).unwrap_err();
        assert!(matches!(err, Error::NotAssociated(found) if found == id));
        assert!(!is_associated(id));
    }

    #[test]
    fn test_registry_does_not_keep_connection_alive() {
        let (_transport, conn) = test_conn();
        let weak = Arc::downgrade(&conn);
        drop(conn);
        assert!(weak.upgrade().is_none(), "registry must not own the connection");
    }

    #[test]
    fn test_unknown_handle_is_not_associated() {
        assert!(!is_associated(u64::MAX));
        assert!(lookup_existing(u64::MAX).is_err());
        // Removing a missing entry is harmless.
        remove(u64::MAX);
    }
}
