//! Integration tests for inbound message routing: filter ordering,
//! object-path resolution and the tri-state result seen by the transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zbus::message::Message;

use dbus_conn::dispatch::{HandlerError, HandlerReply};
use dbus_conn::mainloop::InlineMainLoop;
use dbus_conn::object_path::PathHandlers;
use dbus_conn::{Connection, DispatchResult, MemoryTransport};

fn connected() -> (Arc<MemoryTransport>, Arc<Connection>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MemoryTransport::new();
    let conn = Connection::new_consuming(transport.clone(), Some(Arc::new(InlineMainLoop)))
        .expect("construction");
    (transport, conn)
}

fn method_call(path: &str, member: &str) -> Message {
    Message::method(path, member).unwrap().build(&()).unwrap()
}

#[test]
fn test_filters_run_in_registration_order_until_handled() {
    let (transport, conn) = connected();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    conn.add_filter(Arc::new(move |_, _| {
        log.lock().unwrap().push("first");
        Ok(HandlerReply::Pass)
    }));
    let log = Arc::clone(&order);
    conn.add_filter(Arc::new(move |_, _| {
        log.lock().unwrap().push("second");
        Ok(HandlerReply::Done)
    }));
    let log = Arc::clone(&order);
    conn.add_filter(Arc::new(move |_, _| {
        log.lock().unwrap().push("third");
        Ok(HandlerReply::Done)
    }));

    let result = transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(result, DispatchResult::Handled);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_need_memory_stops_the_chain() {
    let (transport, conn) = connected();
    let reached = Arc::new(AtomicUsize::new(0));

    conn.add_filter(Arc::new(|_, _| Err(HandlerError::OutOfMemory)));
    let count = Arc::clone(&reached);
    conn.add_filter(Arc::new(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerReply::Done)
    }));

    // The transport can retry later; the next filter is not consulted.
    let result = transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(result, DispatchResult::NeedMemory);
    assert_eq!(reached.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unmatched_message_is_not_yet_handled() {
    let (transport, conn) = connected();
    conn.add_filter(Arc::new(|_, _| Ok(HandlerReply::Pass)));

    let result = transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(result, DispatchResult::NotYetHandled);
}

#[test]
fn test_object_path_handler_receives_addressed_messages() {
    let (transport, conn) = connected();
    let hits = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&hits);
    conn.register_object_path(
        "/org/example/Thing",
        PathHandlers::new(Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerReply::Done)
        })),
    )
    .unwrap();

    assert_eq!(
        transport.deliver(&method_call("/org/example/Thing", "Frob")),
        DispatchResult::Handled
    );
    assert_eq!(
        transport.deliver(&method_call("/org/example/Other", "Frob")),
        DispatchResult::NotYetHandled
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_filters_see_messages_before_path_handlers() {
    let (transport, conn) = connected();

    conn.add_filter(Arc::new(|_, _| Ok(HandlerReply::Done)));
    let path_hits = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&path_hits);
    conn.register_object_path(
        "/org/example/Thing",
        PathHandlers::new(Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerReply::Done)
        })),
    )
    .unwrap();

    transport.deliver(&method_call("/org/example/Thing", "Frob"));
    assert_eq!(path_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fallback_handles_subtree() {
    let (transport, conn) = connected();
    let hits = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&hits);
    conn.register_object_path(
        "/org/example",
        PathHandlers::new(Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerReply::Done)
        }))
        .with_fallback(),
    )
    .unwrap();

    assert_eq!(
        transport.deliver(&method_call("/org/example/any/depth", "Frob")),
        DispatchResult::Handled
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lookup_during_unregistration_is_empty() {
    let (_transport, conn) = connected();

    let observed: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let observed_in_hook = Arc::clone(&observed);
    conn.register_object_path(
        "/org/example/Thing",
        PathHandlers::new(Arc::new(|_, _| Ok(HandlerReply::Done))).with_unregister_hook(
            Arc::new(move |conn| {
                // Mid-unregistration must look like never-registered.
                let found = conn.object_path_handlers("/org/example/Thing").is_some();
                *observed_in_hook.lock().unwrap() = Some(found);
            }),
        ),
    )
    .unwrap();

    assert!(conn.object_path_handlers("/org/example/Thing").is_some());
    assert!(conn.unregister_object_path("/org/example/Thing"));
    assert_eq!(*observed.lock().unwrap(), Some(false));

    // Fully unregistered: lookup stays empty, a second removal is a no-op
    // and the path can be registered again.
    assert!(conn.object_path_handlers("/org/example/Thing").is_none());
    assert!(!conn.unregister_object_path("/org/example/Thing"));
    conn.register_object_path(
        "/org/example/Thing",
        PathHandlers::new(Arc::new(|_, _| Ok(HandlerReply::Done))),
    )
    .unwrap();
}

#[test]
fn test_misbehaving_filter_does_not_break_delivery_for_others() {
    let (transport, conn) = connected();
    let hits = Arc::new(AtomicUsize::new(0));

    conn.add_filter(Arc::new(|_, _| panic!("buggy filter")));
    conn.add_filter(Arc::new(|_, _| {
        Err(HandlerError::Failed("also buggy".into()))
    }));
    let count = Arc::clone(&hits);
    conn.add_filter(Arc::new(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerReply::Done)
    }));

    let result = transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(result, DispatchResult::Handled);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_removed_filter_no_longer_runs() {
    let (transport, conn) = connected();
    let hits = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&hits);
    let id = conn.add_filter(Arc::new(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerReply::Done)
    }));

    transport.deliver(&method_call("/org/example", "Frob"));
    assert!(conn.remove_filter(id));
    transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_code_passthrough_end_to_end() {
    let (transport, conn) = connected();
    conn.add_filter(Arc::new(|_, _| {
        Ok(HandlerReply::Code(DispatchResult::Handled.code()))
    }));

    let result = transport.deliver(&method_call("/org/example", "Frob"));
    assert_eq!(result, DispatchResult::Handled);
}
