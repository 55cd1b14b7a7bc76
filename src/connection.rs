//! The managed connection wrapper.
//!
//! A [`Connection`] owns one reference to an opaque transport handle and
//! carries the state callbacks need: the ordered filter list and the
//! object-path handler table. It registers itself in the process-wide
//! handle registry so asynchronous delivery can find its way back from a
//! bare handle identity, and it tears everything down in a fixed order
//! when the last owning reference is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use tracing::{debug, warn};
use zbus::message::Message;

use crate::dispatch::{dispatch, DispatchResult, Handler};
use crate::error::{Error, Result};
use crate::mainloop::{self, MainLoop, MainLoopBinding};
use crate::message::MessageExt;
use crate::object_path::{PathHandlers, PathTable};
use crate::registry;
use crate::transport::{
    allocate_data_slot, Connector, DataSlot, HandleId, SlotValue, Transport, TransportError,
};

/// Identifier of a registered message filter.
pub type FilterId = u64;

struct FilterEntry {
    id: FilterId,
    handler: Handler,
}

// One fixed slot in the transport's side-table, requested once per
// process, holds the registry-cleanup token for every handle.
fn connection_slot() -> DataSlot {
    static CONNECTION_SLOT: OnceLock<DataSlot> = OnceLock::new();
    *CONNECTION_SLOT.get_or_init(allocate_data_slot)
}

/// A D-Bus client connection.
pub struct Connection {
    /// Set once at construction; `None` only during/after the final stage
    /// of teardown. Any live, externally reachable Connection has a
    /// non-`None` handle for as long as filters and object paths are
    /// reachable.
    handle: RwLock<Option<Arc<dyn Transport>>>,
    filters: RwLock<Vec<FilterEntry>>,
    object_paths: RwLock<PathTable>,
    mainloop_binding: Mutex<Option<MainLoopBinding>>,
    next_filter_id: AtomicU64,
    torn_down: AtomicBool,
}

impl Connection {
    /// Open a new private transport for `address` and wrap it.
    ///
    /// The connection is private at the transport level; sharing policy,
    /// if any, belongs to the surrounding system. With `mainloop` absent
    /// the process-wide default is used, failing with
    /// [`Error::NoMainLoop`] if none has been configured.
    pub fn open(
        connector: &dyn Connector,
        address: &str,
        mainloop: Option<Arc<dyn MainLoop>>,
    ) -> Result<Arc<Self>> {
        debug!(address, "opening private connection");
        let handle = connector
            .open_private(address)
            .map_err(|source| Error::ConnectFailed {
                address: address.to_string(),
                source,
            })?;
        Self::new_consuming(handle, mainloop)
    }

    /// Adopt a transport handle created elsewhere (for example by a
    /// higher-level bus-connect operation).
    ///
    /// Fails with [`Error::AlreadyAssociated`] if the handle already
    /// belongs to a live Connection; in that case the handle is left
    /// untouched, since it is owned by its existing wrapper. On every
    /// other failure path the handle is closed and released before the
    /// error is returned.
    pub fn new_consuming(
        handle: Arc<dyn Transport>,
        mainloop: Option<Arc<dyn MainLoop>>,
    ) -> Result<Arc<Self>> {
        let id = handle.id();
        if registry::is_associated(id) {
            warn!(handle = id, "handle already has a connection");
            return Err(Error::AlreadyAssociated(id));
        }

        let mainloop = match mainloop.or_else(mainloop::default) {
            Some(mainloop) => mainloop,
            None => {
                handle.close();
                return Err(Error::NoMainLoop);
            }
        };

        debug!(handle = id, "constructing connection");
        let conn = Arc::new(Self {
            handle: RwLock::new(Some(Arc::clone(&handle))),
            filters: RwLock::new(Vec::new()),
            object_paths: RwLock::new(PathTable::new()),
            mainloop_binding: Mutex::new(None),
            next_filter_id: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        });

        if let Err(err) = registry::install(id, &conn) {
            // Lost a race against another construction; the winner owns
            // the handle, so teardown must not close it.
            conn.disarm();
            return Err(err);
        }

        let token = SlotValue::with_cleanup(Arc::new(id), move || registry::remove(id));
        if !handle.set_data(connection_slot(), Some(token)) {
            drop(conn); // teardown closes the handle and purges the registry
            return Err(Error::Transport(TransportError::NoMemory));
        }

        match mainloop.attach(&conn) {
            Ok(binding) => {
                *conn
                    .mainloop_binding
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(binding);
            }
            Err(err) => {
                warn!(handle = id, error = %err, "main loop attachment failed");
                drop(conn);
                return Err(err);
            }
        }

        Ok(conn)
    }

    /// Recover the Connection owning `id`, for use in callbacks that
    /// receive only the bare handle identity.
    pub fn existing_from_handle(id: HandleId) -> Result<Arc<Self>> {
        registry::lookup_existing(id)
    }

    /// The underlying transport handle.
    ///
    /// Fails with [`Error::InvalidState`] once teardown has cleared it.
    pub fn handle(&self) -> Result<Arc<dyn Transport>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::InvalidState("no transport handle"))
    }

    /// Send a message on the underlying transport.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let handle = self.handle()?;
        handle.send(msg)?;
        Ok(())
    }

    /// Register a filter that sees every inbound message.
    ///
    /// Filters run in registration order; the returned id removes the
    /// filter again.
    pub fn add_filter(&self, handler: Handler) -> FilterId {
        let id = self.next_filter_id.fetch_add(1, Ordering::Relaxed);
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FilterEntry { id, handler });
        debug!(filter = id, "added message filter");
        id
    }

    /// Remove a filter. Returns whether it was still registered.
    pub fn remove_filter(&self, id: FilterId) -> bool {
        let mut filters = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        let before = filters.len();
        filters.retain(|entry| entry.id != id);
        before != filters.len()
    }

    /// Register a handler set for an object path.
    pub fn register_object_path(&self, path: &str, handlers: PathHandlers) -> Result<()> {
        self.object_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(path, handlers)?;
        debug!(path, "registered object path");
        Ok(())
    }

    /// Unregister an object path. Returns whether a registration existed.
    ///
    /// The entry is tombstoned before the unregister hook runs, so a
    /// concurrent lookup for the path already reports "no handler".
    pub fn unregister_object_path(self: &Arc<Self>, path: &str) -> bool {
        let handlers = self
            .object_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .begin_removal(path);
        let Some(handlers) = handlers else {
            return false;
        };
        if let Some(hook) = handlers.on_unregister() {
            hook(self);
        }
        self.object_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .finish_removal(path);
        debug!(path, "unregistered object path");
        true
    }

    /// The handler set registered for exactly `path`.
    ///
    /// "Never registered" and "a concurrent unregistration is in
    /// progress" both come back as `None`.
    pub fn object_path_handlers(&self, path: &str) -> Option<PathHandlers> {
        self.object_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(path)
            .cloned()
    }

    /// Route one inbound message: filters in registration order, then the
    /// object-path handler resolved from the message path.
    ///
    /// `Handled` and `NeedMemory` stop the chain; `NotYetHandled` moves
    /// on to the next handler in line.
    pub fn dispatch_message(self: &Arc<Self>, msg: &Message) -> DispatchResult {
        // Snapshot so handlers may add or remove filters reentrantly.
        let filters: Vec<Handler> = self
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in &filters {
            match dispatch(self, msg, handler) {
                DispatchResult::NotYetHandled => continue,
                result => return result,
            }
        }

        if let Some(path) = msg.path_str() {
            let handlers = self
                .object_paths
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .resolve(&path)
                .cloned();
            if let Some(handlers) = handlers {
                return dispatch(self, msg, handlers.on_message());
            }
        }

        DispatchResult::NotYetHandled
    }

    /// Close the connection.
    ///
    /// Idempotent; the same teardown runs when the last owning reference
    /// is dropped.
    pub fn close(&self) {
        self.teardown();
    }

    /// Neutralize a wrapper that never owned its handle: mark it torn
    /// down and clear the handle field without closing anything.
    fn disarm(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The single teardown routine.
    ///
    /// Ordering is the core invariant. Closing the transport may
    /// synchronously deliver pending callbacks, and callback state in
    /// `filters`/`object_paths` may form reference cycles back to this
    /// Connection, so:
    ///
    /// 1. close the handle while it is still stored (callbacks observe a
    ///    non-`None` handle);
    /// 2. release filters and object paths;
    /// 3. only then clear the handle field and invalidate the registry
    ///    association;
    /// 4. release our transport reference.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self
            .handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(handle) = &handle {
            if handle.is_open() {
                debug!(handle = handle.id(), "closing transport handle");
                handle.close();
            }
        }

        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.object_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .mainloop_binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(handle) = handle {
            registry::remove(handle.id());
            handle.set_data(connection_slot(), None);
            debug!(handle = handle.id(), "released transport handle");
        }
        // `handle` drops here, releasing the reference held since
        // construction.
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle = self
            .handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| h.id());
        f.debug_struct("Connection")
            .field("handle", &handle)
            .field("torn_down", &self.torn_down.load(Ordering::SeqCst))
            .finish()
    }
}
