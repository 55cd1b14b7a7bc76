//! Error types for dbus-conn.

use thiserror::Error;

use crate::transport::{HandleId, TransportError};

/// Result type alias for dbus-conn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or using a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening a transport for an address failed.
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The address that was being opened.
        address: String,
        /// Transport-layer failure detail.
        source: TransportError,
    },

    /// The transport handle already has a live Connection associated with
    /// it. This signals a double-construction bug in the surrounding
    /// system and is never retried.
    #[error("transport handle {0} already has a Connection associated with it")]
    AlreadyAssociated(HandleId),

    /// The transport handle has no live Connection associated with it.
    ///
    /// Returned by registry lookup when the transport layer delivers a
    /// callback for a connection that no longer exists at the wrapper
    /// level. This is an integrity violation, not a soft miss.
    #[error("transport handle {0} has no Connection associated with it")]
    NotAssociated(HandleId),

    /// No main loop was supplied and no process-wide default is
    /// configured. Recoverable by supplying one and retrying.
    #[error(
        "connections must be attached to a main loop: pass one to the \
         constructor or call mainloop::set_default"
    )]
    NoMainLoop,

    /// Attaching the connection to its main loop failed.
    #[error("failed to attach connection to main loop: {0}")]
    AttachFailed(String),

    /// Operation attempted on a Connection whose handle has already been
    /// torn down.
    #[error("connection is in an invalid state: {0}")]
    InvalidState(&'static str),

    /// An object path already has a handler registered.
    #[error("object path {0} already has a handler registered")]
    PathInUse(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
