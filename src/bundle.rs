use std::ops::Range;
use std::rc::Rc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::interface::{
    InterfaceElement, InterfaceTable, LengthStyle, MessageId, ReplyId, ReplyMessageHandler,
    REPLY_MESSAGE_IDENTIFIER,
};
use crate::packet::{Packet, PacketFlags, PacketPtr};
use crate::seq::SeqNum;

/// The on-wire ack count is a single byte.
pub const MAX_ACKS_PER_PACKET: usize = 255;

/// Delivery guarantee requested for a message.
///
/// A `Driver` makes its bundle reliable on its own. A `Passenger` is only
///  reliable because it shares a bundle with a driver; on its own it would
///  be sent unreliably. `Critical` is a driver that additionally marks the
///  channel's critical watermark so it can be force-resent on demand.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReliableType {
    Unreliable,
    Driver,
    Passenger,
    Critical,
}

impl ReliableType {
    pub fn is_reliable(self) -> bool {
        self != ReliableType::Unreliable
    }

    pub fn is_driver(self) -> bool {
        matches!(self, ReliableType::Driver | ReliableType::Critical)
    }
}

/// A request awaiting its reply id, recorded while the bundle is built and
///  consumed by the hub when the bundle is sent.
pub struct ReplyOrder {
    pub handler: Rc<dyn ReplyMessageHandler>,
    pub timeout: Option<Duration>,
    pub packet_idx: usize,
    /// Where the fresh reply id gets patched into the packet at send time.
    pub reply_id_offset: usize,
}

struct InProgressMessage {
    element: InterfaceElement,
    reliable: ReliableType,
    /// Packet and offset of the message id byte.
    header_start: (usize, usize),
    /// Packet and offset of the length field, absent for fixed-length.
    len_field: Option<(usize, usize)>,
    payload_len: usize,
}

/// A batch of messages under construction, streamed into as many packets as
///  it takes. Message headers never straddle a packet boundary; payloads do.
///
/// The bundle records everything the hub needs at send time: which requests
///  want reply ids, which byte ranges are reliable (for piggybacking if the
///  packet is lost), and which acks ride along in the footers.
pub struct Bundle {
    packets: Vec<PacketPtr>,
    /// Footer bytes reserved on every packet beyond the standard set, e.g.
    ///  for the indexed-channel id footer.
    extra_footer_per_packet: usize,

    reliable_ranges: Vec<(usize, Range<usize>)>,
    reply_orders: Vec<ReplyOrder>,
    acks: Vec<(usize, SeqNum)>,

    current_msg: Option<InProgressMessage>,
    /// Location of the last request's next-request link field, patched when
    ///  another request follows in the same packet.
    pending_request_link: Option<(usize, usize)>,

    num_messages: u32,
    num_reliable_messages: u32,
    is_critical: bool,
    finalised: bool,
}

// per-packet reservation: seq (4) + fragment span (8) + checksum (4)
const STANDARD_FOOTER_RESERVE: usize = 16;

impl Bundle {
    pub fn new() -> Bundle {
        Bundle::with_extra_footer(0)
    }

    pub fn with_extra_footer(extra_footer_per_packet: usize) -> Bundle {
        let mut bundle = Bundle {
            packets: Vec::new(),
            extra_footer_per_packet,
            reliable_ranges: Vec::new(),
            reply_orders: Vec::new(),
            acks: Vec::new(),
            current_msg: None,
            pending_request_link: None,
            num_messages: 0,
            num_reliable_messages: 0,
            is_critical: false,
            finalised: false,
        };
        bundle.start_packet();
        bundle
    }

    fn start_packet(&mut self) {
        let packet = Packet::new_ptr();
        let ok = packet
            .borrow_mut()
            .reserve_footer(STANDARD_FOOTER_RESERVE + self.extra_footer_per_packet);
        debug_assert!(ok);
        self.packets.push(packet);
        self.pending_request_link = None;
    }

    fn current_idx(&self) -> usize {
        self.packets.len() - 1
    }

    fn current_packet(&self) -> &PacketPtr {
        self.packets.last().unwrap()
    }

    // ---- message writing -----------------------------------------------

    pub fn start_message(&mut self, element: &InterfaceElement, reliable: ReliableType) {
        assert!(!self.finalised);
        self.end_message();

        let header = element.header_size();
        if self.current_packet().borrow().free_space() < header {
            self.start_packet();
        }

        let pkt = self.current_idx();
        let offset = self.current_packet().borrow().msg_end();
        {
            let mut p = self.current_packet().borrow_mut();
            p.append(&[element.id]);
            p.append(&vec![0u8; element.length.field_size()]);
        }

        self.current_msg = Some(InProgressMessage {
            element: element.clone(),
            reliable,
            header_start: (pkt, offset),
            len_field: match element.length {
                LengthStyle::Fixed(_) => None,
                LengthStyle::Variable(_) => Some((pkt, offset + 1)),
            },
            payload_len: 0,
        });
        self.note_message(reliable);
    }

    /// Starts a request message: a normal message whose header is extended
    ///  with a reply id and a link to the next request in the packet. The
    ///  reply id itself is assigned by the hub when the bundle is sent.
    pub fn start_request(
        &mut self,
        element: &InterfaceElement,
        handler: Rc<dyn ReplyMessageHandler>,
        timeout: Option<Duration>,
        reliable: ReliableType,
    ) {
        assert!(!self.finalised);
        self.end_message();

        // the request extension counts as header and must not straddle;
        // the first request also needs the 2-byte request-offset footer
        let header = element.header_size() + 6;
        {
            let needs_footer =
                !self.current_packet().borrow().has_flags(PacketFlags::HAS_REQUESTS);
            let fits = {
                let mut p = self.current_packet().borrow_mut();
                if needs_footer && !p.reserve_footer(2) {
                    false
                } else {
                    let ok = p.free_space() >= header;
                    if !ok && needs_footer {
                        p.release_footer(2);
                    }
                    ok
                }
            };
            if !fits {
                self.start_packet();
                let mut p = self.current_packet().borrow_mut();
                let ok = p.reserve_footer(2);
                debug_assert!(ok);
            }
        }

        let pkt = self.current_idx();
        let offset = self.current_packet().borrow().msg_end();
        let reply_id_offset;
        let link_offset;
        {
            let mut p = self.current_packet().borrow_mut();
            p.append(&[element.id]);
            p.append(&vec![0u8; element.length.field_size()]);
            reply_id_offset = p.msg_end();
            p.append(&[0u8; 4]); // reply id, patched at send time
            link_offset = p.msg_end();
            p.append(&[0u8; 2]); // next-request link, patched below

            p.enable_flags(PacketFlags::HAS_REQUESTS);
            if p.first_request_offset.is_none() {
                p.first_request_offset = Some(offset as u16);
            }
        }
        if let Some((link_pkt, link_off)) = self.pending_request_link.take() {
            if link_pkt == pkt {
                self.packets[link_pkt]
                    .borrow_mut()
                    .write_u16_at(link_off, offset as u16);
            }
        }
        self.pending_request_link = Some((pkt, link_offset));

        self.reply_orders.push(ReplyOrder {
            handler,
            timeout,
            packet_idx: pkt,
            reply_id_offset,
        });

        self.current_msg = Some(InProgressMessage {
            element: element.clone(),
            reliable,
            header_start: (pkt, offset),
            len_field: match element.length {
                LengthStyle::Fixed(_) => None,
                LengthStyle::Variable(_) => Some((pkt, offset + 1)),
            },
            payload_len: 0,
        });
        self.note_message(reliable);
    }

    /// Starts a reply to a previously received request. The reply id is the
    ///  first four bytes of the payload.
    pub fn start_reply(&mut self, reply_id: ReplyId, reliable: ReliableType) {
        let element = InterfaceElement::variable("reply", REPLY_MESSAGE_IDENTIFIER, 4);
        self.start_message(&element, reliable);
        self.add_bytes(&reply_id.to_be_bytes());
    }

    fn note_message(&mut self, reliable: ReliableType) {
        self.num_messages += 1;
        if reliable.is_reliable() {
            self.num_reliable_messages += 1;
        }
        if reliable == ReliableType::Critical {
            self.is_critical = true;
        }
    }

    /// Streams payload bytes into the current message, splitting to new
    ///  packets as needed.
    pub fn add_bytes(&mut self, mut data: &[u8]) {
        assert!(self.current_msg.is_some(), "no message in progress");
        while !data.is_empty() {
            let free = self.current_packet().borrow().free_space();
            if free == 0 {
                self.start_packet();
                continue;
            }
            let n = free.min(data.len());
            self.current_packet().borrow_mut().append(&data[..n]);
            self.current_msg.as_mut().unwrap().payload_len += n;
            data = &data[n..];
        }
    }

    fn end_message(&mut self) {
        let Some(msg) = self.current_msg.take() else {
            return;
        };

        if let Some((pkt, offset)) = msg.len_field {
            assert!(
                msg.payload_len <= msg.element.length.max_length(),
                "message {} payload of {} bytes overflows its length field",
                msg.element,
                msg.payload_len
            );
            let mut buf = [0u8; 4];
            msg.element.write_length(&mut buf, msg.payload_len);
            self.packets[pkt]
                .borrow_mut()
                .write_bytes_at(offset, &buf[..msg.element.length.field_size()]);
        } else if let LengthStyle::Fixed(expected) = msg.element.length {
            assert_eq!(
                msg.payload_len, expected,
                "fixed-length message {} written with wrong payload size",
                msg.element
            );
        }

        if msg.reliable.is_reliable() {
            let (first_pkt, start) = msg.header_start;
            let last_pkt = self.current_idx();
            for pkt in first_pkt..=last_pkt {
                let begin = if pkt == first_pkt {
                    start
                } else {
                    Packet::BODY_OFFSET
                };
                let end = self.packets[pkt].borrow().msg_end();
                if begin < end {
                    self.merge_reliable_range(pkt, begin..end);
                }
            }
        }
    }

    fn merge_reliable_range(&mut self, pkt: usize, range: Range<usize>) {
        if let Some((last_pkt, last_range)) = self.reliable_ranges.last_mut() {
            if *last_pkt == pkt && last_range.end == range.start {
                last_range.end = range.end;
                return;
            }
        }
        self.reliable_ranges.push((pkt, range));
    }

    // ---- acks ----------------------------------------------------------

    /// Adds an explicit ack to ride in this bundle's footers. The first ack
    ///  on a packet also reserves the count byte; a packet holds at most
    ///  [MAX_ACKS_PER_PACKET] because the wire count is a single byte.
    pub fn add_ack(&mut self, seq: SeqNum) {
        assert!(!self.finalised);
        let on_current = self
            .acks
            .iter()
            .filter(|(pkt, _)| *pkt == self.current_idx())
            .count();
        let needed = if on_current == 0 { 5 } else { 4 };
        if on_current >= MAX_ACKS_PER_PACKET
            || !self.current_packet().borrow_mut().reserve_footer(needed)
        {
            self.start_packet();
            let ok = self.current_packet().borrow_mut().reserve_footer(5);
            debug_assert!(ok);
        }
        self.current_packet()
            .borrow_mut()
            .enable_flags(PacketFlags::HAS_ACKS);
        self.acks.push((self.current_idx(), seq));
    }

    // ---- finalise and accessors ----------------------------------------

    /// Closes the last message and fixes the per-packet delivery flags.
    ///  After this the bundle only changes through send-time footer writing.
    pub fn finalise(&mut self) {
        if self.finalised {
            return;
        }
        self.end_message();
        self.finalised = true;

        let is_reliable = self.num_reliable_messages > 0;
        let is_multi = self.packets.len() > 1;
        for (i, packet) in self.packets.iter().enumerate() {
            let mut p = packet.borrow_mut();
            if is_reliable {
                p.enable_flags(PacketFlags::IS_RELIABLE);
            }
            if is_multi {
                p.enable_flags(PacketFlags::IS_FRAGMENT);
            }
            if is_reliable || is_multi {
                p.enable_flags(PacketFlags::HAS_SEQUENCE_NUMBER);
            }
            if i + 1 < self.packets.len() {
                p.next = Some(self.packets[i + 1].clone());
            }
        }

        trace!(
            packets = self.packets.len(),
            messages = self.num_messages,
            reliable = self.num_reliable_messages,
            "bundle finalised"
        );
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    pub fn packets(&self) -> &[PacketPtr] {
        &self.packets
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn num_messages(&self) -> u32 {
        self.num_messages
    }

    pub fn is_reliable(&self) -> bool {
        self.num_reliable_messages > 0
    }

    pub fn is_critical(&self) -> bool {
        self.is_critical
    }

    pub fn has_requests(&self) -> bool {
        !self.reply_orders.is_empty()
    }

    pub fn take_reply_orders(&mut self) -> Vec<ReplyOrder> {
        std::mem::take(&mut self.reply_orders)
    }

    /// Acks assigned to a given packet, in the order they were added.
    pub fn acks_for(&self, packet_idx: usize) -> impl Iterator<Item = SeqNum> + '_ {
        self.acks
            .iter()
            .filter(move |(pkt, _)| *pkt == packet_idx)
            .map(|(_, seq)| *seq)
    }

    pub fn num_acks(&self) -> usize {
        self.acks.len()
    }

    /// The reliable byte ranges of a packet, used to rebuild its reliable
    ///  traffic as a piggyback if the packet is lost.
    pub fn reliable_ranges_for(&self, packet_idx: usize) -> Vec<Range<usize>> {
        self.reliable_ranges
            .iter()
            .filter(|(pkt, _)| *pkt == packet_idx)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Bundle::new()
    }
}

// ---------------------------------------------------------------------------
// reading side
// ---------------------------------------------------------------------------

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum WalkError {
    UnknownMessageId(MessageId),
    TruncatedHeader,
    TruncatedPayload,
}

/// One message recovered from a received bundle.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct WalkedMessage {
    pub message_id: MessageId,
    /// Present when the sender asked for a reply.
    pub reply_id: Option<ReplyId>,
    pub payload: Bytes,
}

/// Walks the messages of a received bundle across its (already stripped)
///  packet chain. Payloads are reassembled across packet boundaries; headers
///  never straddle, so a header always reads from a single packet.
pub struct MessageWalker<'a> {
    table: &'a InterfaceTable,
    packets: Vec<PacketPtr>,
    pkt: usize,
    offset: usize,
    next_request_offset: usize,
}

impl<'a> MessageWalker<'a> {
    pub fn new(table: &'a InterfaceTable, packets: Vec<PacketPtr>) -> MessageWalker<'a> {
        let next_request_offset = packets
            .first()
            .and_then(|p| p.borrow().first_request_offset)
            .unwrap_or(0) as usize;
        MessageWalker {
            table,
            packets,
            pkt: 0,
            offset: Packet::BODY_OFFSET,
            next_request_offset,
        }
    }

    fn advance_packet(&mut self) -> bool {
        self.pkt += 1;
        if self.pkt >= self.packets.len() {
            return false;
        }
        self.offset = Packet::BODY_OFFSET;
        self.next_request_offset = self.packets[self.pkt]
            .borrow()
            .first_request_offset
            .unwrap_or(0) as usize;
        true
    }

    pub fn next_message(&mut self) -> Option<Result<WalkedMessage, WalkError>> {
        loop {
            if self.pkt >= self.packets.len() {
                return None;
            }
            if self.offset >= self.packets[self.pkt].borrow().msg_end() {
                if !self.advance_packet() {
                    return None;
                }
                continue;
            }
            break;
        }

        let header_offset = self.offset;
        let packet = self.packets[self.pkt].clone();
        let p = packet.borrow();

        let message_id = p.bytes_at(header_offset..header_offset + 1)[0];
        let length_style = if message_id == REPLY_MESSAGE_IDENTIFIER {
            LengthStyle::Variable(4)
        } else {
            match self.table.element(message_id) {
                Some(element) => element.length,
                None => return Some(Err(WalkError::UnknownMessageId(message_id))),
            }
        };

        let is_request = self.next_request_offset != 0 && header_offset == self.next_request_offset;
        let header_size = 1 + length_style.field_size() + if is_request { 6 } else { 0 };
        if header_offset + header_size > p.msg_end() {
            return Some(Err(WalkError::TruncatedHeader));
        }

        let mut offset = header_offset + 1;
        let payload_len = match length_style {
            LengthStyle::Fixed(n) => n,
            LengthStyle::Variable(field) => {
                let raw = p.bytes_at(offset..offset + field as usize);
                let len = match field {
                    1 => raw[0] as usize,
                    2 => u16::from_le_bytes([raw[0], raw[1]]) as usize,
                    _ => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize,
                };
                offset += field as usize;
                len
            }
        };

        let mut reply_id = None;
        if is_request {
            reply_id = Some(p.read_u32_at(offset));
            self.next_request_offset = p.read_u16_at(offset + 4) as usize;
            offset += 6;
        }
        drop(p);
        self.offset = offset;

        let mut payload = BytesMut::with_capacity(payload_len);
        let mut remaining = payload_len;
        while remaining > 0 {
            if self.pkt >= self.packets.len() {
                return Some(Err(WalkError::TruncatedPayload));
            }
            let packet = self.packets[self.pkt].clone();
            let p = packet.borrow();
            let available = p.msg_end().saturating_sub(self.offset);
            if available == 0 {
                drop(p);
                if !self.advance_packet() {
                    return Some(Err(WalkError::TruncatedPayload));
                }
                continue;
            }
            let n = available.min(remaining);
            payload.put_slice(p.bytes_at(self.offset..self.offset + n));
            drop(p);
            self.offset += n;
            remaining -= n;
        }

        Some(Ok(WalkedMessage {
            message_id,
            reply_id,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ReplyMessageHandler;
    use crate::nub::Nub;
    use std::net::SocketAddr;

    struct IgnoreReply;
    impl ReplyMessageHandler for IgnoreReply {
        fn handle_reply(&self, _nub: &mut Nub, _source: SocketAddr, _payload: Bytes) {}
        fn handle_exception(&self, _nub: &mut Nub, _err: crate::error::NetworkError) {}
    }

    fn test_table() -> InterfaceTable {
        struct Noop;
        impl crate::interface::MessageHandler for Noop {
            fn handle_message(&self, _nub: &mut Nub, _msg: crate::interface::IncomingMessage) {}
        }
        let mut table = InterfaceTable::new();
        table.serve(InterfaceElement::fixed("ping", 1, 4), Rc::new(Noop));
        table.serve(InterfaceElement::variable("chat", 2, 2), Rc::new(Noop));
        table.serve(InterfaceElement::variable("blob", 3, 4), Rc::new(Noop));
        table
    }

    #[test]
    fn test_single_packet_roundtrip() {
        let table = test_table();

        let mut bundle = Bundle::new();
        bundle.start_message(&table.element(1).unwrap().clone(), ReliableType::Unreliable);
        bundle.add_bytes(&[1, 2, 3, 4]);
        bundle.start_message(&table.element(2).unwrap().clone(), ReliableType::Driver);
        bundle.add_bytes(b"hello there");
        bundle.finalise();

        assert_eq!(bundle.num_packets(), 1);
        assert!(bundle.is_reliable());

        let mut walker = MessageWalker::new(&table, bundle.packets().to_vec());

        let m1 = walker.next_message().unwrap().unwrap();
        assert_eq!(m1.message_id, 1);
        assert_eq!(m1.reply_id, None);
        assert_eq!(m1.payload.as_ref(), &[1, 2, 3, 4]);

        let m2 = walker.next_message().unwrap().unwrap();
        assert_eq!(m2.message_id, 2);
        assert_eq!(m2.payload.as_ref(), b"hello there");

        assert!(walker.next_message().is_none());
    }

    #[test]
    fn test_fragmented_roundtrip() {
        let table = test_table();
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut bundle = Bundle::new();
        bundle.start_message(&table.element(3).unwrap().clone(), ReliableType::Driver);
        bundle.add_bytes(&big);
        bundle.start_message(&table.element(1).unwrap().clone(), ReliableType::Passenger);
        bundle.add_bytes(&[9, 9, 9, 9]);
        bundle.finalise();

        assert!(bundle.num_packets() > 1);
        for packet in bundle.packets() {
            assert!(packet.borrow().has_flags(
                PacketFlags::IS_FRAGMENT
                    | PacketFlags::HAS_SEQUENCE_NUMBER
                    | PacketFlags::IS_RELIABLE
            ));
        }

        let mut walker = MessageWalker::new(&table, bundle.packets().to_vec());
        let m1 = walker.next_message().unwrap().unwrap();
        assert_eq!(m1.payload.as_ref(), big.as_slice());
        let m2 = walker.next_message().unwrap().unwrap();
        assert_eq!(m2.payload.as_ref(), &[9, 9, 9, 9]);
        assert!(walker.next_message().is_none());
    }

    #[test]
    fn test_requests_link_and_decode() {
        let table = test_table();

        let mut bundle = Bundle::new();
        bundle.start_request(
            &table.element(2).unwrap().clone(),
            Rc::new(IgnoreReply),
            None,
            ReliableType::Driver,
        );
        bundle.add_bytes(b"first");
        bundle.start_message(&table.element(1).unwrap().clone(), ReliableType::Passenger);
        bundle.add_bytes(&[0; 4]);
        bundle.start_request(
            &table.element(2).unwrap().clone(),
            Rc::new(IgnoreReply),
            None,
            ReliableType::Driver,
        );
        bundle.add_bytes(b"second");
        bundle.finalise();

        // patch reply ids the way the hub does at send time
        let orders = bundle.take_reply_orders();
        assert_eq!(orders.len(), 2);
        for (i, order) in orders.iter().enumerate() {
            bundle.packets()[order.packet_idx]
                .borrow_mut()
                .write_u32_at(order.reply_id_offset, 1000 + i as u32);
        }

        assert!(bundle.packets()[0]
            .borrow()
            .has_flags(PacketFlags::HAS_REQUESTS));
        assert!(bundle.packets()[0].borrow().first_request_offset.is_some());

        let mut walker = MessageWalker::new(&table, bundle.packets().to_vec());
        let m1 = walker.next_message().unwrap().unwrap();
        assert_eq!(m1.reply_id, Some(1000));
        assert_eq!(m1.payload.as_ref(), b"first");
        let m2 = walker.next_message().unwrap().unwrap();
        assert_eq!(m2.reply_id, None);
        let m3 = walker.next_message().unwrap().unwrap();
        assert_eq!(m3.reply_id, Some(1001));
        assert_eq!(m3.payload.as_ref(), b"second");
    }

    #[test]
    fn test_reply_message() {
        let table = test_table();
        let mut bundle = Bundle::new();
        bundle.start_reply(0xABCD_1234, ReliableType::Driver);
        bundle.add_bytes(b"result");
        bundle.finalise();

        let mut walker = MessageWalker::new(&table, bundle.packets().to_vec());
        let m = walker.next_message().unwrap().unwrap();
        assert_eq!(m.message_id, REPLY_MESSAGE_IDENTIFIER);
        assert_eq!(&m.payload[..4], &0xABCD_1234u32.to_be_bytes());
        assert_eq!(&m.payload[4..], b"result");
    }

    #[test]
    fn test_unknown_message_id() {
        let table = test_table();
        let mut other = InterfaceTable::new();
        struct Noop;
        impl crate::interface::MessageHandler for Noop {
            fn handle_message(&self, _nub: &mut Nub, _msg: crate::interface::IncomingMessage) {}
        }
        other.serve(InterfaceElement::fixed("only-here", 42, 1), Rc::new(Noop));

        let mut bundle = Bundle::new();
        bundle.start_message(&other.element(42).unwrap().clone(), ReliableType::Unreliable);
        bundle.add_bytes(&[7]);
        bundle.finalise();

        let mut walker = MessageWalker::new(&table, bundle.packets().to_vec());
        assert_eq!(
            walker.next_message().unwrap(),
            Err(WalkError::UnknownMessageId(42))
        );
    }

    #[test]
    fn test_reliable_ranges_cover_reliable_messages_only() {
        let table = test_table();
        let mut bundle = Bundle::new();
        bundle.start_message(&table.element(1).unwrap().clone(), ReliableType::Unreliable);
        bundle.add_bytes(&[0; 4]);
        bundle.start_message(&table.element(2).unwrap().clone(), ReliableType::Driver);
        bundle.add_bytes(b"keep me");
        bundle.finalise();

        let ranges = bundle.reliable_ranges_for(0);
        assert_eq!(ranges.len(), 1);
        // unreliable message: 1 id + 4 payload starting at the body offset
        assert_eq!(ranges[0].start, Packet::BODY_OFFSET + 5);
        assert_eq!(ranges[0].end, bundle.packets()[0].borrow().msg_end());
        assert!(bundle.reliable_ranges_for(1).is_empty());
    }

    #[test]
    fn test_adjacent_reliable_ranges_merge() {
        let table = test_table();
        let mut bundle = Bundle::new();
        bundle.start_message(&table.element(2).unwrap().clone(), ReliableType::Driver);
        bundle.add_bytes(b"one");
        bundle.start_message(&table.element(2).unwrap().clone(), ReliableType::Driver);
        bundle.add_bytes(b"two");
        bundle.finalise();

        assert_eq!(bundle.reliable_ranges_for(0).len(), 1);
    }

    #[test]
    fn test_acks_recorded_per_packet() {
        let mut bundle = Bundle::new();
        bundle.add_ack(SeqNum::new(3));
        bundle.add_ack(SeqNum::new(9));
        bundle.finalise();

        assert!(bundle.packets()[0].borrow().has_flags(PacketFlags::HAS_ACKS));
        let acks: Vec<_> = bundle.acks_for(0).collect();
        assert_eq!(acks, vec![SeqNum::new(3), SeqNum::new(9)]);
        assert_eq!(bundle.num_acks(), 2);
    }

    #[test]
    fn test_acks_split_at_the_count_byte_limit() {
        let mut bundle = Bundle::new();
        for i in 0..300u32 {
            bundle.add_ack(SeqNum::new(i));
        }
        bundle.finalise();

        assert_eq!(bundle.num_packets(), 2);
        assert_eq!(bundle.acks_for(0).count(), MAX_ACKS_PER_PACKET);
        assert_eq!(bundle.acks_for(1).count(), 300 - MAX_ACKS_PER_PACKET);
        assert!(bundle.packets()[1].borrow().has_flags(PacketFlags::HAS_ACKS));
        assert_eq!(bundle.num_acks(), 300);
    }

    #[test]
    fn test_critical_marks_bundle() {
        let table = test_table();
        let mut bundle = Bundle::new();
        bundle.start_message(&table.element(1).unwrap().clone(), ReliableType::Critical);
        bundle.add_bytes(&[0; 4]);
        bundle.finalise();
        assert!(bundle.is_critical());
        assert!(bundle.is_reliable());
    }
}
