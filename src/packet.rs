use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::seq::SeqNum;

bitflags! {
    /// The first two bytes of every packet. Each flag announces a footer
    ///  section or a delivery property of the packet.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct PacketFlags: u16 {
        const HAS_REQUESTS        = 0x0001;
        const HAS_PIGGYBACKS      = 0x0002;
        const HAS_ACKS            = 0x0004;
        const ON_CHANNEL          = 0x0008;
        const IS_RELIABLE         = 0x0010;
        const IS_FRAGMENT         = 0x0020;
        const HAS_SEQUENCE_NUMBER = 0x0040;
        const INDEXED_CHANNEL     = 0x0080;
        const HAS_CHECKSUM        = 0x0100;
        const CREATE_CHANNEL      = 0x0200;
    }
}

pub type PacketPtr = Rc<RefCell<Packet>>;

/// Which part of a channel a packet belongs to when the channel is
///  serialized for handover to another hub.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketStreamState {
    UnackedSend,
    BufferedReceive,
    ChainedFragment,
}

/// XOR of the big-endian 4-byte words of `data`. A trailing partial word is
///  zero-padded, which matches the zeroed checksum field that follows it on
///  the wire.
pub fn xor_checksum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        sum ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut word = [0u8; 4];
        word[..rem.len()].copy_from_slice(rem);
        sum ^= u32::from_be_bytes(word);
    }
    sum
}

/// A single UDP datagram in flight or under construction.
///
/// Layout: `[flags u16][message body ...][footers ...]`. The body grows
///  forward from [Packet::BODY_OFFSET] while footer space is pre-reserved at
///  the tail so a message can never squeeze out a footer it already promised.
///  Footers are written after the body in physical order and stripped by the
///  receiver back to front, so `msg_end` marks the body/footer boundary on
///  the send side and the strip cursor on the receive side.
pub struct Packet {
    data: Box<[u8; Packet::MAX_SIZE]>,
    /// End of the message region; `data[BODY_OFFSET..msg_end]` is body.
    msg_end: usize,
    /// End of everything, including footers.
    len: usize,
    /// Tail bytes promised to footers while the body is still growing.
    reserved_footer: usize,

    pub next: Option<PacketPtr>,

    pub seq: Option<SeqNum>,
    pub first_request_offset: Option<u16>,
    pub fragment_span: Option<(SeqNum, SeqNum)>,
    pub channel_id: Option<u32>,
    pub channel_version: Option<u32>,
    /// The footer region holding this packet's own piggyback blocks, kept so
    ///  the blocks can be nested if this packet is itself piggybacked later.
    pub piggy_footer_range: Option<Range<usize>>,

    // resend bookkeeping, owned by the channel's send window
    pub was_resent: bool,
}

impl Packet {
    pub const MAX_SIZE: usize = 1472;
    pub const BODY_OFFSET: usize = 2;

    pub fn new() -> Packet {
        Packet {
            data: Box::new([0u8; Packet::MAX_SIZE]),
            msg_end: Packet::BODY_OFFSET,
            len: Packet::BODY_OFFSET,
            reserved_footer: 0,
            next: None,
            seq: None,
            first_request_offset: None,
            fragment_span: None,
            channel_id: None,
            channel_version: None,
            piggy_footer_range: None,
            was_resent: false,
        }
    }

    pub fn new_ptr() -> PacketPtr {
        Rc::new(RefCell::new(Packet::new()))
    }

    /// Wraps a received datagram. `None` if it cannot even hold the flags
    ///  word or exceeds the maximum frame size.
    pub fn from_datagram(datagram: &[u8]) -> Option<Packet> {
        if datagram.len() < Packet::BODY_OFFSET || datagram.len() > Packet::MAX_SIZE {
            return None;
        }
        let mut p = Packet::new();
        p.data[..datagram.len()].copy_from_slice(datagram);
        p.len = datagram.len();
        p.msg_end = datagram.len();
        Some(p)
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_retain(u16::from_be_bytes([self.data[0], self.data[1]]))
    }

    pub fn enable_flags(&mut self, flags: PacketFlags) {
        let new = self.flags() | flags;
        self.data[..2].copy_from_slice(&new.bits().to_be_bytes());
    }

    pub fn disable_flags(&mut self, flags: PacketFlags) {
        let new = self.flags() - flags;
        self.data[..2].copy_from_slice(&new.bits().to_be_bytes());
    }

    pub fn has_flags(&self, flags: PacketFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Total size on the wire, footers included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.msg_end == Packet::BODY_OFFSET
    }

    pub fn msg_end(&self) -> usize {
        self.msg_end
    }

    pub fn body(&self) -> &[u8] {
        &self.data[Packet::BODY_OFFSET..self.msg_end]
    }

    pub fn wire_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn bytes_at(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    // ---- send-side building --------------------------------------------

    pub fn free_space(&self) -> usize {
        Packet::MAX_SIZE - self.msg_end - self.reserved_footer
    }

    pub fn reserve_footer(&mut self, n: usize) -> bool {
        if self.free_space() < n {
            return false;
        }
        self.reserved_footer += n;
        true
    }

    pub fn release_footer(&mut self, n: usize) {
        debug_assert!(self.reserved_footer >= n);
        self.reserved_footer -= n;
    }

    pub fn reserved_footer(&self) -> usize {
        self.reserved_footer
    }

    /// Appends message bytes to the body. Only legal while no footers have
    ///  been written yet; the caller checks [Packet::free_space] first.
    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.msg_end, self.len);
        debug_assert!(bytes.len() <= self.free_space());
        self.data[self.msg_end..self.msg_end + bytes.len()].copy_from_slice(bytes);
        self.msg_end += bytes.len();
        self.len = self.msg_end;
    }

    pub fn append_footer_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.len + bytes.len() <= Packet::MAX_SIZE);
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.reserved_footer = self.reserved_footer.saturating_sub(bytes.len());
    }

    pub fn append_footer_u8(&mut self, value: u8) {
        self.append_footer_bytes(&[value]);
    }

    pub fn append_footer_u16(&mut self, value: u16) {
        self.append_footer_bytes(&value.to_be_bytes());
    }

    pub fn append_footer_u32(&mut self, value: u32) {
        self.append_footer_bytes(&value.to_be_bytes());
    }

    /// Appends the zeroed checksum word, then overwrites it with the XOR of
    ///  everything before it.
    pub fn append_checksum(&mut self) {
        self.append_footer_u32(0);
        let sum = xor_checksum(&self.data[..self.len - 4]);
        self.write_u32_at(self.len - 4, sum);
    }

    pub fn write_bytes_at(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u16_at(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32_at(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn read_u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn read_u32_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    // ---- receive-side stripping ----------------------------------------

    /// Removes `n` bytes from the tail of the message region, returning the
    ///  removed range. `None` if fewer than `n` body bytes remain.
    pub fn strip_region(&mut self, n: usize) -> Option<Range<usize>> {
        if self.msg_end < Packet::BODY_OFFSET + n {
            return None;
        }
        self.msg_end -= n;
        Some(self.msg_end..self.msg_end + n)
    }

    pub fn strip_u8(&mut self) -> Option<u8> {
        let r = self.strip_region(1)?;
        Some(self.data[r.start])
    }

    pub fn strip_u16(&mut self) -> Option<u16> {
        let r = self.strip_region(2)?;
        Some(self.read_u16_at(r.start))
    }

    pub fn strip_u32(&mut self) -> Option<u32> {
        let r = self.strip_region(4)?;
        Some(self.read_u32_at(r.start))
    }

    /// Verifies and removes the checksum footer. The checksum was computed
    ///  with its own field zeroed, so the stripped word must equal the XOR
    ///  over the remaining bytes.
    pub fn strip_checksum(&mut self) -> bool {
        let Some(stated) = self.strip_u32() else {
            return false;
        };
        stated == xor_checksum(&self.data[..self.msg_end])
    }

    // ---- chaining ------------------------------------------------------

    pub fn chain_len(first: &PacketPtr) -> usize {
        let mut n = 1;
        let mut cursor = first.borrow().next.clone();
        while let Some(p) = cursor {
            n += 1;
            cursor = p.borrow().next.clone();
        }
        n
    }

    // ---- channel offload streaming -------------------------------------

    pub fn add_to_stream(&self, buf: &mut BytesMut, state: PacketStreamState) {
        buf.put_usize_varint(self.msg_end);
        match state {
            PacketStreamState::UnackedSend => {
                // unacked packets keep their footers so a resend is a
                // byte-identical retransmission
                buf.put_usize_varint(self.len);
                buf.put_slice(&self.data[..self.len]);
            }
            PacketStreamState::BufferedReceive | PacketStreamState::ChainedFragment => {
                buf.put_usize_varint(self.msg_end);
                buf.put_slice(&self.data[..self.msg_end]);
            }
        }
        buf.put_u32(self.seq.map(SeqNum::to_raw).unwrap_or(u32::MAX));
        buf.put_u16(self.first_request_offset.unwrap_or(0));
        match self.fragment_span {
            Some((first, last)) => {
                buf.put_u8(1);
                buf.put_u32(first.to_raw());
                buf.put_u32(last.to_raw());
            }
            None => buf.put_u8(0),
        }
        buf.put_u8(self.was_resent as u8);
    }

    pub fn from_stream(buf: &mut impl Buf, _state: PacketStreamState) -> Option<Packet> {
        let msg_end = buf.try_get_usize_varint().ok()?;
        let len = buf.try_get_usize_varint().ok()?;
        if len > Packet::MAX_SIZE || msg_end > len || buf.remaining() < len {
            return None;
        }
        let mut p = Packet::new();
        buf.copy_to_slice(&mut p.data[..len]);
        p.msg_end = msg_end;
        p.len = len;

        if buf.remaining() < 4 + 2 + 1 {
            return None;
        }
        let raw_seq = buf.get_u32();
        p.seq = if raw_seq == u32::MAX {
            None
        } else {
            SeqNum::from_wire(raw_seq)
        };
        let req_off = buf.get_u16();
        p.first_request_offset = if req_off == 0 { None } else { Some(req_off) };
        match buf.get_u8() {
            0 => {}
            1 => {
                if buf.remaining() < 8 {
                    return None;
                }
                let first = SeqNum::from_wire(buf.get_u32())?;
                let last = SeqNum::from_wire(buf.get_u32())?;
                p.fragment_span = Some((first, last));
            }
            _ => return None,
        }
        if buf.remaining() < 1 {
            return None;
        }
        p.was_resent = buf.get_u8() != 0;
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_flags_roundtrip() {
        let mut p = Packet::new();
        assert_eq!(p.flags(), PacketFlags::empty());

        p.enable_flags(PacketFlags::IS_RELIABLE | PacketFlags::HAS_SEQUENCE_NUMBER);
        assert!(p.has_flags(PacketFlags::IS_RELIABLE));
        assert!(p.has_flags(PacketFlags::HAS_SEQUENCE_NUMBER));
        assert!(!p.has_flags(PacketFlags::HAS_ACKS));

        p.disable_flags(PacketFlags::IS_RELIABLE);
        assert!(!p.has_flags(PacketFlags::IS_RELIABLE));
        assert_eq!(p.wire_bytes()[..2], [0x00, 0x40]);
    }

    #[test]
    fn test_body_and_footer_layout() {
        let mut p = Packet::new();
        p.append(b"hello");
        assert!(p.reserve_footer(6));
        assert_eq!(p.free_space(), Packet::MAX_SIZE - 2 - 5 - 6);

        p.append_footer_u32(0xDEAD_BEEF);
        p.append_footer_u16(0x0102);
        assert_eq!(p.len(), 2 + 5 + 6);
        assert_eq!(p.body(), b"hello");
        assert_eq!(
            &p.wire_bytes()[7..],
            &[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02]
        );
    }

    #[test]
    fn test_strip_reverses_append() {
        let mut sender = Packet::new();
        sender.append(b"abc");
        sender.reserve_footer(7);
        sender.append_footer_u32(42);
        sender.append_footer_u16(7);
        sender.append_footer_u8(9);

        let mut receiver = Packet::from_datagram(sender.wire_bytes()).unwrap();
        assert_eq!(receiver.strip_u8(), Some(9));
        assert_eq!(receiver.strip_u16(), Some(7));
        assert_eq!(receiver.strip_u32(), Some(42));
        assert_eq!(receiver.body(), b"abc");
        // body bytes are not strippable as a footer beyond their count
        assert_eq!(receiver.strip_u32(), None);
    }

    #[rstest]
    #[case::whole_words(vec![1, 2, 3, 4, 5, 6, 7, 8], 0x0102_0304 ^ 0x0506_0708)]
    #[case::partial_tail(vec![1, 2, 3, 4, 0xAA], 0x0102_0304 ^ 0xAA00_0000)]
    #[case::empty(vec![], 0)]
    fn test_xor_checksum(#[case] data: Vec<u8>, #[case] expected: u32) {
        assert_eq!(xor_checksum(&data), expected);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut p = Packet::new();
        p.enable_flags(PacketFlags::HAS_CHECKSUM);
        p.append(b"some payload bytes");
        p.reserve_footer(4);
        p.append_checksum();

        let mut received = Packet::from_datagram(p.wire_bytes()).unwrap();
        assert!(received.strip_checksum());
        assert_eq!(received.body(), b"some payload bytes");
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut p = Packet::new();
        p.append(b"some payload bytes");
        p.reserve_footer(4);
        p.append_checksum();

        let mut wire = p.wire_bytes().to_vec();
        wire[5] ^= 0x10;
        let mut received = Packet::from_datagram(&wire).unwrap();
        assert!(!received.strip_checksum());
    }

    #[test]
    fn test_from_datagram_bounds() {
        assert!(Packet::from_datagram(&[]).is_none());
        assert!(Packet::from_datagram(&[0]).is_none());
        assert!(Packet::from_datagram(&[0, 0]).is_some());
        assert!(Packet::from_datagram(&vec![0; Packet::MAX_SIZE + 1]).is_none());
    }

    #[test]
    fn test_stream_roundtrip_unacked() {
        let mut p = Packet::new();
        p.enable_flags(PacketFlags::IS_RELIABLE | PacketFlags::HAS_SEQUENCE_NUMBER);
        p.append(b"payload");
        p.reserve_footer(4);
        p.append_footer_u32(77);
        p.seq = Some(SeqNum::new(77));
        p.was_resent = true;

        let mut buf = BytesMut::new();
        p.add_to_stream(&mut buf, PacketStreamState::UnackedSend);

        let restored = Packet::from_stream(&mut buf, PacketStreamState::UnackedSend).unwrap();
        assert_eq!(restored.wire_bytes(), p.wire_bytes());
        assert_eq!(restored.msg_end(), p.msg_end());
        assert_eq!(restored.seq, Some(SeqNum::new(77)));
        assert!(restored.was_resent);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_stream_roundtrip_buffered_receive() {
        let mut p = Packet::from_datagram(&[0, 0x40, 1, 2, 3, 4, 5, 6]).unwrap();
        let seq_region = p.strip_region(4).unwrap();
        assert_eq!(seq_region, 4..8);
        p.seq = Some(SeqNum::new(9));
        p.fragment_span = Some((SeqNum::new(9), SeqNum::new(11)));

        let mut buf = BytesMut::new();
        p.add_to_stream(&mut buf, PacketStreamState::BufferedReceive);

        let restored = Packet::from_stream(&mut buf, PacketStreamState::BufferedReceive).unwrap();
        // footers were already stripped, only the message region travels
        assert_eq!(restored.len(), p.msg_end());
        assert_eq!(restored.body(), p.body());
        assert_eq!(restored.seq, Some(SeqNum::new(9)));
        assert_eq!(
            restored.fragment_span,
            Some((SeqNum::new(9), SeqNum::new(11)))
        );
    }

    #[test]
    fn test_from_stream_rejects_truncation() {
        let mut p = Packet::new();
        p.append(b"x");
        let mut buf = BytesMut::new();
        p.add_to_stream(&mut buf, PacketStreamState::UnackedSend);
        let mut truncated = buf.split_to(buf.len() - 3);
        assert!(Packet::from_stream(&mut truncated, PacketStreamState::UnackedSend).is_none());
    }
}
