//! dbus-conn - D-Bus client connection lifecycle and message dispatch.
//!
//! This crate models the part of a D-Bus client that sits between an
//! opaque, reference-counted transport handle and the code that handles
//! messages: a [`Connection`] wrapper owning the handle, a process-wide
//! weak registry that recovers the wrapper from a bare handle identity
//! during asynchronous delivery, and a dispatch engine whose tri-state
//! result contract keeps misbehaving handlers from ever crashing message
//! delivery.
//!
//! Wire encoding, I/O multiplexing and bus semantics are left to the
//! messaging library behind the [`transport::Transport`] boundary.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mainloop;
pub mod message;
pub mod object_path;
pub mod registry;
pub mod transport;

pub use connection::{Connection, FilterId};
pub use dispatch::{
    dispatch, DispatchResult, Handler, HandlerError, HandlerOutcome, HandlerReply,
};
pub use error::{Error, Result};
pub use mainloop::{InlineMainLoop, MainLoop, MainLoopBinding};
pub use object_path::PathHandlers;
pub use transport::{Connector, HandleId, MemoryConnector, MemoryTransport, Transport};
