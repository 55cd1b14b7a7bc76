//! The transport boundary.
//!
//! The core treats the messaging library underneath it as an opaque
//! collaborator: it opens and closes reference-counted transport handles,
//! sends framed messages on them, and receives inbound messages through a
//! registered callback. Everything below that line (wire format, socket
//! handling, authentication) belongs to the transport implementation.
//!
//! [`MemoryTransport`] is an in-process implementation used by the test
//! suite and by embedders that want to drive dispatch without a real bus.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};
use zbus::message::Message;

use crate::dispatch::DispatchResult;

/// Opaque identity of a transport handle.
///
/// Identities are assigned by the transport implementation and are unique
/// for the lifetime of the process.
pub type HandleId = u64;

/// Callback invoked by the transport layer when a message arrives.
///
/// The callback receives the identity of the handle the message arrived
/// on and returns the tri-state dispatch result the transport uses to
/// decide whether to keep offering the message to other handlers.
pub type MessageCallback = Arc<dyn Fn(HandleId, &Message) -> DispatchResult + Send + Sync>;

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// The address string is not supported by this transport.
    #[error("unsupported transport address: {0}")]
    BadAddress(String),

    /// The handle has been closed.
    #[error("transport handle is closed")]
    Closed,

    /// The transport ran out of memory.
    #[error("transport ran out of memory")]
    NoMemory,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// A slot in the fixed side-table a transport handle offers for attaching
/// opaque per-handle data.
///
/// Slots are allocated once per concern via [`allocate_data_slot`] and
/// shared by all handles, mirroring the registry-bucket allocation done at
/// process startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataSlot(usize);

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

/// Allocate a fresh data slot id.
pub fn allocate_data_slot() -> DataSlot {
    DataSlot(NEXT_SLOT.fetch_add(1, Ordering::Relaxed))
}

/// An opaque value stored in a transport handle's data slot.
///
/// The cleanup hook runs when the value is replaced, cleared, or when the
/// handle itself is destroyed, so slot-backed state is purged even if the
/// owning wrapper never runs its own teardown.
pub struct SlotValue {
    value: Arc<dyn Any + Send + Sync>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl SlotValue {
    /// Create a slot value with no cleanup hook.
    pub fn new(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            value,
            cleanup: None,
        }
    }

    /// Create a slot value whose cleanup hook runs when the value is
    /// dropped by the transport.
    pub fn with_cleanup(
        value: Arc<dyn Any + Send + Sync>,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            value,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// The stored value.
    pub fn value(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.value)
    }
}

impl Drop for SlotValue {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotValue")
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// A reference-counted native transport handle.
///
/// The core holds exactly one `Arc` clone per `Connection` and releases it
/// once, at final teardown. Other subsystems may hold their own clones;
/// the handle's side-table cleanup hooks run when the last clone drops.
pub trait Transport: Send + Sync {
    /// The handle's identity.
    fn id(&self) -> HandleId;

    /// Whether the handle is still open.
    fn is_open(&self) -> bool;

    /// Close the handle. Idempotent: closing twice is safe.
    ///
    /// Closing may synchronously deliver pending callbacks (for example a
    /// disconnected notification) through the registered message callback.
    fn close(&self);

    /// Send a framed message.
    fn send(&self, msg: &Message) -> std::result::Result<(), TransportError>;

    /// Register or clear the message-arrived callback.
    fn set_message_callback(&self, callback: Option<MessageCallback>);

    /// Store or clear a value in the handle's data-slot side-table.
    ///
    /// Returns `false` if the transport could not store the value.
    fn set_data(&self, slot: DataSlot, value: Option<SlotValue>) -> bool;

    /// Read the value stored in a data slot, if any.
    fn get_data(&self, slot: DataSlot) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Opens private transport handles for address strings.
///
/// Private means unshared at the transport level; sharing policy, if any,
/// is the surrounding system's responsibility.
pub trait Connector: Send + Sync {
    /// Open a new private handle for `address`.
    fn open_private(&self, address: &str)
        -> std::result::Result<Arc<dyn Transport>, TransportError>;
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An in-process transport handle.
///
/// Sent messages are recorded for inspection; inbound messages are
/// injected with [`MemoryTransport::deliver`] and flow through the
/// registered message callback exactly like messages from a real bus.
/// Messages queued with [`MemoryTransport::queue_on_close`] are delivered
/// synchronously by [`Transport::close`], reproducing the shape of
/// close-triggered disconnect notifications.
pub struct MemoryTransport {
    id: HandleId,
    open: AtomicBool,
    callback: Mutex<Option<MessageCallback>>,
    slots: Mutex<HashMap<DataSlot, SlotValue>>,
    sent: Mutex<Vec<Message>>,
    close_pending: Mutex<Vec<Message>>,
}

impl MemoryTransport {
    /// Create a new open handle with a fresh identity.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
            callback: Mutex::new(None),
            slots: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            close_pending: Mutex::new(Vec::new()),
        })
    }

    /// Deliver an inbound message through the registered callback.
    ///
    /// Returns the callback's dispatch result, or `NotYetHandled` if no
    /// callback is registered.
    pub fn deliver(&self, msg: &Message) -> DispatchResult {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(self.id, msg),
            None => {
                trace!(handle = self.id, "no message callback registered");
                DispatchResult::NotYetHandled
            }
        }
    }

    /// Queue a message for synchronous delivery when the handle is closed.
    pub fn queue_on_close(&self, msg: Message) {
        self.close_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
    }

    /// The messages sent on this handle so far.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a message callback is currently registered.
    pub fn has_message_callback(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> HandleId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(handle = self.id, "closing in-process transport");
        let pending: Vec<Message> = self
            .close_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for msg in pending {
            let _ = self.deliver(&msg);
        }
    }

    fn send(&self, msg: &Message) -> std::result::Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        trace!(handle = self.id, "recording sent message");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg.clone());
        Ok(())
    }

    fn set_message_callback(&self, callback: Option<MessageCallback>) {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn set_data(&self, slot: DataSlot, value: Option<SlotValue>) -> bool {
        // The previous value is dropped outside the lock so its cleanup
        // hook may touch this handle again.
        let previous = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match value {
                Some(value) => slots.insert(slot, value),
                None => slots.remove(&slot),
            }
        };
        drop(previous);
        true
    }

    fn get_data(&self, slot: DataSlot) -> Option<Arc<dyn Any + Send + Sync>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .map(SlotValue::value)
    }
}

/// Connector for [`MemoryTransport`] handles.
///
/// Accepts addresses of the form `mem:<name>` and keeps the handles it
/// opened so tests can inspect them.
pub struct MemoryConnector {
    opened: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
        }
    }

    /// The most recently opened handle, if any.
    pub fn last_opened(&self) -> Option<Arc<MemoryTransport>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn open_private(
        &self,
        address: &str,
    ) -> std::result::Result<Arc<dyn Transport>, TransportError> {
        if !address.starts_with("mem:") {
            return Err(TransportError::BadAddress(address.to_string()));
        }
        let transport = MemoryTransport::new();
        debug!(address, handle = transport.id(), "opened in-process transport");
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
