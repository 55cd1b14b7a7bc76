//! Message dispatch across the transport boundary.
//!
//! The transport layer offers each inbound message to handlers one at a
//! time and uses the tri-state [`DispatchResult`] to decide whether to
//! keep going. A handler failure must never unwind through the transport
//! layer's call stack: [`dispatch`] converts every failure mode into a
//! dispatch result, reporting the detail through the process error channel
//! where the contract requires it.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::{error, trace};
use zbus::message::Message;

use crate::connection::Connection;

/// The contract between a handler and the message-delivery loop.
///
/// `NeedMemory` specifically signals "retry me once memory pressure
/// subsides" rather than "this handler does not apply".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// The message was handled; stop offering it to other handlers.
    Handled,
    /// The message was not handled; offer it to the next handler in line.
    NotYetHandled,
    /// The handler ran out of memory; the transport may retry later.
    NeedMemory,
}

impl DispatchResult {
    /// The wire-level integer code for this result.
    pub fn code(self) -> i64 {
        match self {
            DispatchResult::Handled => 0,
            DispatchResult::NotYetHandled => 1,
            DispatchResult::NeedMemory => 2,
        }
    }

    /// Map an integer code back to a result, if it is in range.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DispatchResult::Handled),
            1 => Some(DispatchResult::NotYetHandled),
            2 => Some(DispatchResult::NeedMemory),
            _ => None,
        }
    }
}

/// What a handler returned on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReply {
    /// Nothing to report: the message was handled.
    Done,
    /// Not applicable: pass the message on.
    Pass,
    /// A raw dispatch result code. Codes outside the tri-state range are
    /// a contract violation by the handler.
    Code(i64),
}

/// A failure raised by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not allocate memory. Suppressed by dispatch and
    /// translated to [`DispatchResult::NeedMemory`].
    #[error("handler ran out of memory")]
    OutOfMemory,

    /// Any other handler failure. Reported through the error channel,
    /// never propagated to the transport layer.
    #[error("{0}")]
    Failed(String),
}

/// Outcome of a single handler invocation.
pub type HandlerOutcome = std::result::Result<HandlerReply, HandlerError>;

/// A message handler: a filter or an object-path callback.
pub type Handler = Arc<dyn Fn(&Arc<Connection>, &Message) -> HandlerOutcome + Send + Sync>;

/// A dispatch-time failure surfaced through the error channel.
///
/// These are reported, not returned: dispatch itself always produces a
/// [`DispatchResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A handler returned a failure other than out-of-memory.
    #[error("message handler failed: {0}")]
    HandlerFailed(String),

    /// A handler panicked; the panic was caught at the dispatch boundary.
    #[error("message handler panicked: {0}")]
    HandlerPanicked(String),

    /// A handler returned an integer outside the tri-state range.
    #[error("message handler returned {0}, expected a dispatch result code in 0..=2")]
    ContractViolation(i64),
}

/// The process-wide top-level error reporting path for dispatch failures.
pub trait ErrorSink: Send + Sync {
    /// Record one dispatch failure.
    fn report(&self, error: &DispatchError);
}

static ERROR_SINK: RwLock<Option<Arc<dyn ErrorSink>>> = RwLock::new(None);

/// Install or clear the process error sink.
///
/// With no sink installed, dispatch failures are logged via `tracing`.
pub fn set_error_sink(sink: Option<Arc<dyn ErrorSink>>) {
    *ERROR_SINK.write().unwrap_or_else(PoisonError::into_inner) = sink;
}

fn report(err: DispatchError) {
    let sink = ERROR_SINK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match sink {
        Some(sink) => sink.report(&err),
        None => error!(error = %err, "dispatch error"),
    }
}

// Callback invocations are serialized process-wide. The gate is reentrant
// per thread so a handler that triggers nested dispatch (for example by
// closing its own connection, which delivers pending callbacks
// synchronously) runs the nested handlers inline instead of deadlocking.
static GATE: Mutex<()> = Mutex::new(());

thread_local! {
    static GATE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct DepthReset;

impl Drop for DepthReset {
    fn drop(&mut self) {
        GATE_DEPTH.with(|depth| depth.set(0));
    }
}

fn with_gate<R>(f: impl FnOnce() -> R) -> R {
    GATE_DEPTH.with(|depth| {
        if depth.get() > 0 {
            return f();
        }
        let _guard = GATE.lock().unwrap_or_else(PoisonError::into_inner);
        depth.set(1);
        let _reset = DepthReset;
        f()
    })
}

/// Pass a message through a handler.
///
/// The handler runs to completion under the dispatch gate; every failure
/// mode is mapped to a [`DispatchResult`]:
///
/// - [`HandlerReply::Done`] becomes `Handled`, [`HandlerReply::Pass`]
///   becomes `NotYetHandled`;
/// - an in-range [`HandlerReply::Code`] passes through, an out-of-range
///   one is reported as a contract violation and becomes `NotYetHandled`;
/// - [`HandlerError::OutOfMemory`] is suppressed and becomes `NeedMemory`;
/// - any other failure, including a panic, is reported through the error
///   channel and becomes `NotYetHandled`.
pub fn dispatch(conn: &Arc<Connection>, msg: &Message, handler: &Handler) -> DispatchResult {
    let outcome = with_gate(|| catch_unwind(AssertUnwindSafe(|| handler(conn, msg))));
    match outcome {
        Ok(Ok(HandlerReply::Done)) => {
            trace!("handler reported done");
            DispatchResult::Handled
        }
        Ok(Ok(HandlerReply::Pass)) => {
            trace!("handler passed, continuing");
            DispatchResult::NotYetHandled
        }
        Ok(Ok(HandlerReply::Code(code))) => match DispatchResult::from_code(code) {
            Some(result) => result,
            None => {
                report(DispatchError::ContractViolation(code));
                DispatchResult::NotYetHandled
            }
        },
        Ok(Err(HandlerError::OutOfMemory)) => {
            // The one failure the transport layer can act on itself.
            DispatchResult::NeedMemory
        }
        Ok(Err(HandlerError::Failed(detail))) => {
            report(DispatchError::HandlerFailed(detail));
            DispatchResult::NotYetHandled
        }
        Err(panic) => {
            report(DispatchError::HandlerPanicked(panic_message(panic.as_ref())));
            DispatchResult::NotYetHandled
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
