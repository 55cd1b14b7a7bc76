//! D-Bus message utilities.
//!
//! Thin accessor helpers over `zbus::message::Message`; the wire format
//! itself is entirely the messaging library's business.

use zbus::message::{Message, Type as MessageType};

/// Extension trait for working with D-Bus messages.
pub trait MessageExt {
    /// Get the object path of the message.
    fn path_str(&self) -> Option<String>;

    /// Get the interface of the message.
    fn interface_str(&self) -> Option<String>;

    /// Get the member (method/signal name) of the message.
    fn member_str(&self) -> Option<String>;

    /// Get the sender of the message.
    fn sender_str(&self) -> Option<String>;

    /// Get the serial number of the message.
    fn serial(&self) -> u32;

    /// Check if this is a method call.
    fn is_method_call(&self) -> bool;

    /// Check if this is a signal.
    fn is_signal(&self) -> bool;
}

impl MessageExt for Message {
    fn path_str(&self) -> Option<String> {
        self.header().path().map(|p| p.to_string())
    }

    fn interface_str(&self) -> Option<String> {
        self.header().interface().map(|i| i.to_string())
    }

    fn member_str(&self) -> Option<String> {
        self.header().member().map(|m| m.to_string())
    }

    fn sender_str(&self) -> Option<String> {
        self.header().sender().map(|s| s.to_string())
    }

    fn serial(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn is_method_call(&self) -> bool {
        self.primary_header().msg_type() == MessageType::MethodCall
    }

    fn is_signal(&self) -> bool {
        self.primary_header().msg_type() == MessageType::Signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_call_accessors() {
        let msg = Message::method("/org/example/Thing", "Frob")
            .unwrap()
            .interface("org.example.Iface")
            .unwrap()
            .build(&())
            .unwrap();

        assert!(msg.is_method_call());
        assert!(!msg.is_signal());
        assert_eq!(msg.path_str().as_deref(), Some("/org/example/Thing"));
        assert_eq!(msg.member_str().as_deref(), Some("Frob"));
        assert_eq!(msg.interface_str().as_deref(), Some("org.example.Iface"));
        assert!(msg.serial() > 0);
    }

    #[test]
    fn test_signal_accessors() {
        let msg = Message::signal("/org/example", "org.example.Iface", "Changed")
            .unwrap()
            .build(&())
            .unwrap();

        assert!(msg.is_signal());
        assert!(!msg.is_method_call());
        assert_eq!(msg.member_str().as_deref(), Some("Changed"));
    }
}
