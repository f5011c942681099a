use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::NetworkError;
use crate::nub::Nub;
use crate::timer::TimerId;

pub type MessageId = u8;
pub type ReplyId = u32;

/// The message id reserved for replies to requests. Replies are dispatched
///  by reply id instead of the interface table, so this id can never be
///  served by an application handler.
pub const REPLY_MESSAGE_IDENTIFIER: MessageId = 0xFF;

/// How a message's payload length appears on the wire after the message id.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LengthStyle {
    /// No length field; every instance of the message has this payload size.
    Fixed(usize),
    /// A little-endian length field of 1, 2 or 4 bytes.
    Variable(u8),
}

impl LengthStyle {
    pub fn field_size(self) -> usize {
        match self {
            LengthStyle::Fixed(_) => 0,
            LengthStyle::Variable(n) => n as usize,
        }
    }

    /// The biggest payload this style can express.
    pub fn max_length(self) -> usize {
        match self {
            LengthStyle::Fixed(n) => n,
            LengthStyle::Variable(1) => u8::MAX as usize,
            LengthStyle::Variable(2) => u16::MAX as usize,
            _ => u32::MAX as usize,
        }
    }
}

/// One entry of a message interface: a wire id plus the framing needed to
///  recover the payload length on the receiving side.
#[derive(Clone, Debug)]
pub struct InterfaceElement {
    pub name: &'static str,
    pub id: MessageId,
    pub length: LengthStyle,
}

impl InterfaceElement {
    pub fn fixed(name: &'static str, id: MessageId, length: usize) -> InterfaceElement {
        InterfaceElement {
            name,
            id,
            length: LengthStyle::Fixed(length),
        }
    }

    pub fn variable(name: &'static str, id: MessageId, field_size: u8) -> InterfaceElement {
        debug_assert!(matches!(field_size, 1 | 2 | 4));
        InterfaceElement {
            name,
            id,
            length: LengthStyle::Variable(field_size),
        }
    }

    /// Header size on the wire, excluding the request extension.
    pub fn header_size(&self) -> usize {
        1 + self.length.field_size()
    }

    pub fn write_length(&self, buf: &mut [u8], len: usize) {
        debug_assert!(len <= self.length.max_length());
        match self.length {
            LengthStyle::Fixed(_) => {}
            LengthStyle::Variable(1) => buf[0] = len as u8,
            LengthStyle::Variable(2) => buf[..2].copy_from_slice(&(len as u16).to_le_bytes()),
            _ => buf[..4].copy_from_slice(&(len as u32).to_le_bytes()),
        }
    }

    pub fn read_length(&self, buf: &[u8]) -> usize {
        match self.length {
            LengthStyle::Fixed(n) => n,
            LengthStyle::Variable(1) => buf[0] as usize,
            LengthStyle::Variable(2) => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            _ => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        }
    }
}

impl Display for InterfaceElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.id)
    }
}

/// An incoming message as presented to a handler. The payload is owned so
///  a handler may stash it without copying.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub source: SocketAddr,
    pub message_id: MessageId,
    /// Set when the sender asked for a reply. Pass it to [Nub::send_reply].
    pub reply_id: Option<ReplyId>,
    pub payload: Bytes,
}

/// Application callback for a served message id. Handlers run inline on the
///  hub's thread and get mutable access to the hub so they can send.
pub trait MessageHandler {
    fn handle_message(&self, nub: &mut Nub, msg: IncomingMessage);
}

/// Callback for the outcome of a request started with a reply handler:
///  exactly one of the two methods is invoked, exactly once.
pub trait ReplyMessageHandler {
    fn handle_reply(&self, nub: &mut Nub, source: SocketAddr, payload: Bytes);
    fn handle_exception(&self, nub: &mut Nub, err: NetworkError);
}

/// Callback for application timers registered on the hub's timer queue.
pub trait TimerExpiryHandler {
    fn handle_timeout(&self, nub: &mut Nub, id: TimerId);
}

struct ServedElement {
    element: InterfaceElement,
    handler: Rc<dyn MessageHandler>,
}

/// Registry of all message ids this hub can receive, indexed by wire id.
#[derive(Default)]
pub struct InterfaceTable {
    entries: Vec<Option<ServedElement>>,
}

impl InterfaceTable {
    pub fn new() -> InterfaceTable {
        let mut entries = Vec::with_capacity(256);
        entries.resize_with(256, || None);
        InterfaceTable { entries }
    }

    /// Registers a handler for an element. Panics on an id collision or on
    ///  the reserved reply id since both are interface definition bugs.
    pub fn serve(&mut self, element: InterfaceElement, handler: Rc<dyn MessageHandler>) {
        assert_ne!(
            element.id, REPLY_MESSAGE_IDENTIFIER,
            "message id {} is reserved for replies",
            REPLY_MESSAGE_IDENTIFIER
        );
        if self.entries.is_empty() {
            self.entries.resize_with(256, || None);
        }
        let slot = &mut self.entries[element.id as usize];
        assert!(
            slot.is_none(),
            "message id {} registered twice",
            element.id
        );
        *slot = Some(ServedElement { element, handler });
    }

    pub fn element(&self, id: MessageId) -> Option<&InterfaceElement> {
        self.entries
            .get(id as usize)
            .and_then(|e| e.as_ref())
            .map(|e| &e.element)
    }

    pub fn handler(&self, id: MessageId) -> Option<Rc<dyn MessageHandler>> {
        self.entries
            .get(id as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct NoopHandler;
    impl MessageHandler for NoopHandler {
        fn handle_message(&self, _nub: &mut Nub, _msg: IncomingMessage) {}
    }

    #[rstest]
    #[case::fixed(LengthStyle::Fixed(8), 0)]
    #[case::var1(LengthStyle::Variable(1), 1)]
    #[case::var2(LengthStyle::Variable(2), 2)]
    #[case::var4(LengthStyle::Variable(4), 4)]
    fn test_field_size(#[case] style: LengthStyle, #[case] expected: usize) {
        assert_eq!(style.field_size(), expected);
    }

    #[rstest]
    #[case::var1(InterfaceElement::variable("a", 1, 1), 200, vec![200])]
    #[case::var2(InterfaceElement::variable("b", 2, 2), 0x1234, vec![0x34, 0x12])]
    #[case::var4(InterfaceElement::variable("c", 3, 4), 0x0102_0304, vec![4, 3, 2, 1])]
    fn test_length_roundtrip(
        #[case] element: InterfaceElement,
        #[case] len: usize,
        #[case] expected_wire: Vec<u8>,
    ) {
        let mut buf = [0u8; 4];
        element.write_length(&mut buf, len);
        assert_eq!(&buf[..expected_wire.len()], expected_wire.as_slice());
        assert_eq!(element.read_length(&buf), len);
    }

    #[test]
    fn test_serve_and_lookup() {
        let mut table = InterfaceTable::new();
        table.serve(InterfaceElement::fixed("ping", 7, 0), Rc::new(NoopHandler));

        assert_eq!(table.element(7).unwrap().name, "ping");
        assert!(table.handler(7).is_some());
        assert!(table.element(8).is_none());
        assert!(table.handler(8).is_none());
    }

    #[test]
    #[should_panic]
    fn test_serve_reply_id_rejected() {
        let mut table = InterfaceTable::new();
        table.serve(
            InterfaceElement::fixed("bad", REPLY_MESSAGE_IDENTIFIER, 0),
            Rc::new(NoopHandler),
        );
    }

    #[test]
    #[should_panic]
    fn test_serve_twice_rejected() {
        let mut table = InterfaceTable::new();
        table.serve(InterfaceElement::fixed("a", 3, 0), Rc::new(NoopHandler));
        table.serve(InterfaceElement::variable("b", 3, 2), Rc::new(NoopHandler));
    }
}
