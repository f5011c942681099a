use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Range;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{ChannelCategory, EffectiveChannelConfig, SendWindowCallback};
use crate::error::Reason;
use crate::fragment::FragmentedBundle;
use crate::packet::{Packet, PacketFlags, PacketPtr, PacketStreamState};
use crate::seq::SeqNum;

pub type ChannelId = u32;
pub type ChannelPtr = Rc<std::cell::RefCell<Channel>>;

/// Outcome of registering a freshly sequenced packet with the send window.
#[derive(Debug)]
pub enum AddResend {
    /// The packet occupies a window slot; transmit it now.
    Windowed,
    /// The window is full; the packet is queued and must not be transmitted
    ///  until an ack frees a slot and promotes it.
    Overflowed,
    Failed(Reason),
}

/// A packet moved from the overflow queue into the window by an ack; the
///  hub transmits these right after processing the ack.
pub struct PromotedSend {
    pub seq: SeqNum,
    pub packet: PacketPtr,
}

/// What to do with a sequenced packet arriving on this channel.
pub enum IncomingDecision {
    /// In-order; deliver these packets (the new one plus any buffered
    ///  successors it released), in sequence order.
    Deliver(Vec<PacketPtr>),
    /// Ahead of the cursor; buffered until the gap fills.
    Buffered,
    /// Already delivered once. Still worth acking, the previous ack may
    ///  have been lost.
    Duplicate,
    /// Too far ahead to be genuine.
    OutOfWindow,
}

/// A resend candidate as handed to the hub, which picks between a direct
///  retransmission and piggybacking onto an outgoing packet.
pub struct ResendInfo {
    pub seq: SeqNum,
    pub packet: PacketPtr,
    pub reliable_ranges: Vec<Range<usize>>,
    pub can_piggyback: bool,
}

struct WindowSlot {
    packet: PacketPtr,
    reliable_ranges: Vec<Range<usize>>,
    first_sent: Instant,
    last_sent: Instant,
    /// The channel's next-to-assign sequence number when this packet was
    ///  last transmitted. An ack for anything at or past this value proves
    ///  the transmission was overtaken, i.e. lost.
    last_sent_at_out_seq: SeqNum,
    was_resent: bool,
    in_missing: bool,
    next_missing: Option<SeqNum>,
}

struct OverflowPacket {
    seq: SeqNum,
    packet: PacketPtr,
    reliable_ranges: Vec<Range<usize>>,
}

/// Per-peer reliability state: a selective-repeat send window with an
///  overflow queue and a linked sublist of known-missing packets, plus the
///  inbound sequencing cursor with its buffer of early arrivals.
///
/// The channel never touches the socket. Every operation that implies
///  transmission returns the packets to send, and the hub does the I/O.
pub struct Channel {
    addr: SocketAddr,
    id: Option<ChannelId>,
    version: u32,
    config: EffectiveChannelConfig,
    send_window_callback: Option<SendWindowCallback>,

    anonymous: bool,
    irregular: bool,
    condemned_since: Option<Instant>,
    wants_first_packet: bool,
    remote_failure: Option<Reason>,

    // outbound
    small_out_seq_at: SeqNum,
    large_out_seq_at: SeqNum,
    window: Vec<Option<WindowSlot>>,
    overflow: VecDeque<OverflowPacket>,
    first_missing: Option<SeqNum>,
    last_missing: Option<SeqNum>,
    last_ack: Option<SeqNum>,
    unacked_critical_seq: Option<SeqNum>,
    round_trip_time: Duration,
    num_unacked: u32,
    last_window_warn: u32,

    // inbound
    in_seq_at: SeqNum,
    buffered_receives: Vec<Option<PacketPtr>>,
    num_buffered: u32,
    pub fragments: Option<FragmentedBundle>,
    acks_to_send: Vec<SeqNum>,

    // counters
    num_packets_resent: u32,
    num_duplicates_received: u32,
}

impl Channel {
    pub fn new(
        addr: SocketAddr,
        id: Option<ChannelId>,
        config: EffectiveChannelConfig,
        send_window_callback: Option<SendWindowCallback>,
    ) -> Channel {
        let window_size = config.window_size as usize;
        let mut window = Vec::with_capacity(window_size);
        window.resize_with(window_size, || None);
        let mut buffered_receives = Vec::with_capacity(window_size);
        buffered_receives.resize_with(window_size, || None);

        Channel {
            addr,
            id,
            version: 0,
            round_trip_time: config.min_inactivity_resend_delay,
            config,
            send_window_callback,
            anonymous: false,
            irregular: false,
            condemned_since: None,
            wants_first_packet: true,
            remote_failure: None,
            small_out_seq_at: SeqNum::ZERO,
            large_out_seq_at: SeqNum::ZERO,
            window,
            overflow: VecDeque::new(),
            first_missing: None,
            last_missing: None,
            last_ack: None,
            unacked_critical_seq: None,
            num_unacked: 0,
            last_window_warn: 0,
            in_seq_at: SeqNum::ZERO,
            buffered_receives,
            num_buffered: 0,
            fragments: None,
            acks_to_send: Vec::new(),
            num_packets_resent: 0,
            num_duplicates_received: 0,
        }
    }

    pub fn new_ptr(
        addr: SocketAddr,
        id: Option<ChannelId>,
        config: EffectiveChannelConfig,
        send_window_callback: Option<SendWindowCallback>,
    ) -> ChannelPtr {
        Rc::new(std::cell::RefCell::new(Channel::new(
            addr,
            id,
            config,
            send_window_callback,
        )))
    }

    fn idx(&self, seq: SeqNum) -> usize {
        (seq.to_raw() & (self.config.window_size - 1)) as usize
    }

    // ---- identity ------------------------------------------------------

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> Option<ChannelId> {
        self.id
    }

    pub fn is_indexed(&self) -> bool {
        self.id.is_some()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn category(&self) -> ChannelCategory {
        self.config.category
    }

    pub fn is_external(&self) -> bool {
        self.config.category != ChannelCategory::Internal
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn set_anonymous(&mut self, anonymous: bool) {
        self.anonymous = anonymous;
    }

    pub fn is_irregular(&self) -> bool {
        self.irregular
    }

    pub fn set_irregular(&mut self, irregular: bool) {
        self.irregular = irregular;
    }

    /// Whether the next outgoing packet should carry the channel-creation
    ///  flag so the peer auto-creates its end.
    pub fn take_wants_first_packet(&mut self) -> bool {
        std::mem::take(&mut self.wants_first_packet)
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Accepts a peer address change if the claimed channel version is not
    ///  older than ours. Entity channels roam between frontends this way.
    pub fn switch_addr(&mut self, new_addr: SocketAddr, version: u32) -> bool {
        let age = self.version.wrapping_sub(version);
        if age != 0 && age < u32::MAX / 2 {
            return false;
        }
        if new_addr != self.addr {
            debug!("channel to {} switching to {} (version {})", self.addr, new_addr, version);
            self.addr = new_addr;
        }
        self.version = version;
        true
    }

    // ---- condemnation --------------------------------------------------

    pub fn condemn(&mut self) {
        if self.condemned_since.is_none() {
            self.condemned_since = Some(Instant::now());
        }
    }

    pub fn is_condemned(&self) -> bool {
        self.condemned_since.is_some()
    }

    pub fn condemned_since(&self) -> Option<Instant> {
        self.condemned_since
    }

    /// Set when a datagram to the peer was refused at the socket level,
    ///  e.g. an ICMP port-unreachable. Sends on the channel are refused
    ///  with this reason until the owner tears it down.
    pub fn remote_failure(&self) -> Option<Reason> {
        self.remote_failure
    }

    pub fn set_remote_failure(&mut self, reason: Reason) {
        self.remote_failure = Some(reason);
    }

    /// A channel is drained when nothing it sent is still awaiting an ack.
    pub fn is_drained(&self) -> bool {
        self.num_unacked == 0
    }

    pub fn num_unacked(&self) -> u32 {
        self.num_unacked
    }

    pub fn round_trip_time(&self) -> Duration {
        self.round_trip_time
    }

    pub fn num_packets_resent(&self) -> u32 {
        self.num_packets_resent
    }

    // ---- outbound ------------------------------------------------------

    pub fn use_next_sequence_id(&mut self) -> SeqNum {
        let seq = self.large_out_seq_at;
        self.large_out_seq_at = self.large_out_seq_at.next();
        seq
    }

    pub fn next_sequence_id(&self) -> SeqNum {
        self.large_out_seq_at
    }

    pub fn oldest_unacked_seq(&self) -> SeqNum {
        self.small_out_seq_at
    }

    /// Registers a reliable packet for resending until acked. Returns
    ///  whether it fits the window or joined the overflow queue; the hub
    ///  must not transmit overflowed packets.
    pub fn add_resend_timer(
        &mut self,
        seq: SeqNum,
        packet: PacketPtr,
        reliable_ranges: Vec<Range<usize>>,
        now: Instant,
    ) -> AddResend {
        let in_window = seq.dist_after(self.small_out_seq_at) < self.config.window_size;

        if !in_window {
            if self.config.max_overflow_packets > 0
                && self.overflow.len() as u32 >= self.config.max_overflow_packets
            {
                warn!(
                    "channel to {} overflowed hard at {} overflow packets",
                    self.addr,
                    self.overflow.len()
                );
                return AddResend::Failed(Reason::WindowOverflow);
            }
            self.overflow.push_back(OverflowPacket {
                seq,
                packet,
                reliable_ranges,
            });
            self.note_unacked_grew();
            return AddResend::Overflowed;
        }

        let idx = self.idx(seq);
        debug_assert!(self.window[idx].is_none());
        self.window[idx] = Some(WindowSlot {
            packet,
            reliable_ranges,
            first_sent: now,
            last_sent: now,
            last_sent_at_out_seq: self.large_out_seq_at,
            was_resent: false,
            in_missing: false,
            next_missing: None,
        });
        self.note_unacked_grew();
        AddResend::Windowed
    }

    fn note_unacked_grew(&mut self) {
        self.num_unacked += 1;
        if self.num_unacked > self.config.send_window_warn_threshold
            && self.num_unacked > self.last_window_warn
        {
            warn!(
                "channel to {} has {} unacked packets (threshold {})",
                self.addr, self.num_unacked, self.config.send_window_warn_threshold
            );
            if let Some(cb) = &self.send_window_callback {
                cb(self.addr, self.num_unacked as usize);
            }
            self.last_window_warn = self.num_unacked;
        }
    }

    pub fn mark_critical(&mut self) {
        if self.large_out_seq_at != self.small_out_seq_at {
            self.unacked_critical_seq = Some(self.large_out_seq_at.prev());
        }
    }

    /// Processes an incoming ack. Returns the overflow packets the freed
    ///  window space promoted; the hub transmits them immediately.
    pub fn del_resend_timer(
        &mut self,
        seq: SeqNum,
        now: Instant,
    ) -> Result<Vec<PromotedSend>, Reason> {
        if seq_in_range(seq, self.small_out_seq_at, self.large_out_seq_at) {
            // in flight, fall through
        } else if seq.seq_less_than(self.small_out_seq_at) {
            // ack for something already fully acked, a late duplicate
            return Ok(Vec::new());
        } else {
            return Err(Reason::CorruptedPacket);
        }

        let idx = self.idx(seq);
        let Some(slot) = self.window[idx].take() else {
            // acked twice, e.g. via a resent packet
            return Ok(Vec::new());
        };
        if slot.packet.borrow().seq != Some(seq) {
            // the slot belongs to a different lap of the window
            self.window[idx] = Some(slot);
            return Ok(Vec::new());
        }

        if !slot.was_resent {
            let sample = now.duration_since(slot.first_sent);
            let rtt = self.round_trip_time.as_secs_f64();
            self.round_trip_time =
                Duration::from_secs_f64(rtt + (sample.as_secs_f64() - rtt) / 10.0);
        }
        if slot.in_missing {
            self.unlink_missing(seq);
        }
        self.num_unacked -= 1;
        if self.num_unacked == 0 {
            self.last_window_warn = 0;
        }

        if self
            .last_ack
            .map(|last| last.seq_less_than(seq))
            .unwrap_or(true)
        {
            self.last_ack = Some(seq);
        }
        if self
            .unacked_critical_seq
            .map(|c| !seq.seq_less_than(c))
            .unwrap_or(false)
        {
            self.unacked_critical_seq = None;
        }

        if seq == self.small_out_seq_at {
            self.advance_small_out_seq();
        } else {
            // a gap before this ack: everything older and unacked is now a
            // loss suspect
            let mut s = self.small_out_seq_at;
            while s != seq {
                let idx = self.idx(s);
                let should_link = match &self.window[idx] {
                    Some(slot) => !slot.in_missing && slot.packet.borrow().seq == Some(s),
                    None => false,
                };
                if should_link {
                    self.link_missing(s);
                }
                s = s.next();
            }
        }

        Ok(self.promote_overflow(now))
    }

    /// Drops a packet from the window because its reliable payload was
    ///  piggybacked onto a live packet, which now guarantees its delivery.
    pub fn remove_for_piggyback(&mut self, seq: SeqNum, now: Instant) -> Vec<PromotedSend> {
        let idx = self.idx(seq);
        let Some(slot) = self.window[idx].take() else {
            return Vec::new();
        };
        if slot.in_missing {
            self.unlink_missing(seq);
        }
        self.num_unacked -= 1;
        if seq == self.small_out_seq_at {
            self.advance_small_out_seq();
        }
        self.promote_overflow(now)
    }

    fn advance_small_out_seq(&mut self) {
        loop {
            if self.small_out_seq_at == self.large_out_seq_at {
                break;
            }
            if let Some(head) = self.overflow.front() {
                if head.seq == self.small_out_seq_at {
                    break;
                }
            }
            let idx = self.idx(self.small_out_seq_at);
            if let Some(slot) = &self.window[idx] {
                if slot.packet.borrow().seq == Some(self.small_out_seq_at) {
                    break;
                }
            }
            self.small_out_seq_at = self.small_out_seq_at.next();
        }
    }

    fn promote_overflow(&mut self, now: Instant) -> Vec<PromotedSend> {
        let mut promoted = Vec::new();
        while let Some(head) = self.overflow.front() {
            if head.seq.dist_after(self.small_out_seq_at) >= self.config.window_size {
                break;
            }
            let head = self.overflow.pop_front().unwrap();
            let idx = self.idx(head.seq);
            debug_assert!(self.window[idx].is_none());
            promoted.push(PromotedSend {
                seq: head.seq,
                packet: head.packet.clone(),
            });
            self.window[idx] = Some(WindowSlot {
                packet: head.packet,
                reliable_ranges: head.reliable_ranges,
                first_sent: now,
                last_sent: now,
                last_sent_at_out_seq: self.large_out_seq_at,
                was_resent: false,
                in_missing: false,
                next_missing: None,
            });
        }
        if !promoted.is_empty() {
            trace!(
                "channel to {}: promoted {} overflow packets",
                self.addr,
                promoted.len()
            );
        }
        promoted
    }

    fn link_missing(&mut self, seq: SeqNum) {
        if let Some(last) = self.last_missing {
            let idx = self.idx(last);
            if let Some(slot) = &mut self.window[idx] {
                slot.next_missing = Some(seq);
            }
        } else {
            self.first_missing = Some(seq);
        }
        self.last_missing = Some(seq);
        let idx = self.idx(seq);
        if let Some(slot) = &mut self.window[idx] {
            slot.in_missing = true;
            slot.next_missing = None;
        }
    }

    fn unlink_missing(&mut self, seq: SeqNum) {
        let mut prev: Option<SeqNum> = None;
        let mut cursor = self.first_missing;
        while let Some(m) = cursor {
            let next = self.window[self.idx(m)].as_ref().and_then(|s| s.next_missing);
            if m == seq {
                match prev {
                    Some(p) => {
                        let idx = self.idx(p);
                        if let Some(slot) = &mut self.window[idx] {
                            slot.next_missing = next;
                        }
                    }
                    None => self.first_missing = next,
                }
                if self.last_missing == Some(seq) {
                    self.last_missing = prev;
                }
                return;
            }
            prev = Some(m);
            cursor = next;
        }
    }

    /// The sequence numbers due for retransmission: members of the missing
    ///  list that were provably overtaken by a later ack, plus any unacked
    ///  packet that has sat unconfirmed longer than the inactivity
    ///  threshold (twice the RTT, floored by configuration).
    pub fn check_resend_timers(&mut self, now: Instant) -> Vec<SeqNum> {
        let mut due = Vec::new();

        if let Some(last_ack) = self.last_ack {
            let mut cursor = self.first_missing;
            while let Some(m) = cursor {
                let slot = self.window[self.idx(m)].as_ref();
                cursor = slot.and_then(|s| s.next_missing);
                if let Some(slot) = slot {
                    if slot.last_sent_at_out_seq.seq_less_than(last_ack)
                        || slot.last_sent_at_out_seq == last_ack
                    {
                        due.push(m);
                    }
                }
            }
        }

        let threshold = std::cmp::max(
            2 * self.round_trip_time,
            self.config.min_inactivity_resend_delay,
        );
        let mut s = self.small_out_seq_at;
        while s != self.large_out_seq_at {
            if let Some(slot) = &self.window[self.idx(s)] {
                if slot.packet.borrow().seq == Some(s)
                    && now.duration_since(slot.last_sent) >= threshold
                    && !due.contains(&s)
                {
                    due.push(s);
                }
            }
            s = s.next();
        }
        due
    }

    /// All unacked packets up to the critical watermark, for an immediate
    ///  forced resend.
    pub fn critical_resends(&self) -> Vec<SeqNum> {
        let Some(critical) = self.unacked_critical_seq else {
            return Vec::new();
        };
        let mut due = Vec::new();
        let mut s = self.small_out_seq_at;
        while s != self.large_out_seq_at {
            if !critical.seq_less_than(s) {
                if let Some(slot) = &self.window[self.idx(s)] {
                    if slot.packet.borrow().seq == Some(s) {
                        due.push(s);
                    }
                }
            }
            s = s.next();
        }
        due
    }

    pub fn resend_info(&self, seq: SeqNum) -> Option<ResendInfo> {
        let slot = self.window[self.idx(seq)].as_ref()?;
        let packet = slot.packet.clone();
        if packet.borrow().seq != Some(seq) {
            return None;
        }
        let can_piggyback =
            self.is_external() && !packet.borrow().has_flags(PacketFlags::IS_FRAGMENT);
        Some(ResendInfo {
            seq,
            packet,
            reliable_ranges: slot.reliable_ranges.clone(),
            can_piggyback,
        })
    }

    /// Marks a direct retransmission: the packet counts as resent (so it no
    ///  longer feeds the RTT estimate) and its loss detection restarts.
    pub fn mark_resent(&mut self, seq: SeqNum, now: Instant) {
        let large = self.large_out_seq_at;
        let idx = self.idx(seq);
        if let Some(slot) = &mut self.window[idx] {
            slot.was_resent = true;
            slot.last_sent = now;
            slot.last_sent_at_out_seq = large;
            slot.packet.borrow_mut().was_resent = true;
        }
        self.num_packets_resent += 1;
    }

    pub fn has_unacked_criticals(&self) -> bool {
        self.unacked_critical_seq.is_some()
    }

    // ---- inbound -------------------------------------------------------

    pub fn expected_in_seq(&self) -> SeqNum {
        self.in_seq_at
    }

    /// Sequencing decision for a received sequenced packet.
    pub fn record_incoming(&mut self, packet: PacketPtr) -> IncomingDecision {
        let seq = match packet.borrow().seq {
            Some(seq) => seq,
            None => return IncomingDecision::OutOfWindow,
        };

        if seq == self.in_seq_at {
            let mut delivered = vec![packet];
            self.in_seq_at = self.in_seq_at.next();
            loop {
                let idx = self.idx(self.in_seq_at);
                let next_buffered = self.buffered_receives[idx]
                    .as_ref()
                    .map(|b| b.borrow().seq == Some(self.in_seq_at))
                    .unwrap_or(false);
                if !next_buffered {
                    break;
                }
                delivered.push(self.buffered_receives[idx].take().unwrap());
                self.num_buffered -= 1;
                self.in_seq_at = self.in_seq_at.next();
            }
            return IncomingDecision::Deliver(delivered);
        }

        if seq.seq_less_than(self.in_seq_at) {
            self.num_duplicates_received += 1;
            return IncomingDecision::Duplicate;
        }

        if seq.dist_after(self.in_seq_at) >= self.config.window_size {
            return IncomingDecision::OutOfWindow;
        }

        let idx = self.idx(seq);
        let already_buffered = self.buffered_receives[idx]
            .as_ref()
            .map(|b| b.borrow().seq == Some(seq))
            .unwrap_or(false);
        if already_buffered {
            self.num_duplicates_received += 1;
            IncomingDecision::Duplicate
        } else {
            self.buffered_receives[idx] = Some(packet);
            self.num_buffered += 1;
            IncomingDecision::Buffered
        }
    }

    pub fn num_buffered_receives(&self) -> u32 {
        self.num_buffered
    }

    pub fn num_duplicates_received(&self) -> u32 {
        self.num_duplicates_received
    }

    pub fn queue_ack(&mut self, seq: SeqNum) {
        self.acks_to_send.push(seq);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.acks_to_send.is_empty()
    }

    pub fn take_pending_acks(&mut self) -> Vec<SeqNum> {
        std::mem::take(&mut self.acks_to_send)
    }

    // ---- offload streaming ---------------------------------------------

    /// Serializes the channel's protocol state for handover to another hub,
    ///  e.g. when an entity migrates between processes.
    pub fn add_to_stream(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        buf.put_u32(self.small_out_seq_at.to_raw());
        buf.put_u32(self.large_out_seq_at.to_raw());
        buf.put_u32(self.in_seq_at.to_raw());
        buf.put_u32(self.last_ack.map(SeqNum::to_raw).unwrap_or(u32::MAX));
        buf.put_u32(
            self.unacked_critical_seq
                .map(SeqNum::to_raw)
                .unwrap_or(u32::MAX),
        );

        let mut unacked: Vec<(SeqNum, &WindowSlot)> = Vec::new();
        let mut s = self.small_out_seq_at;
        while s != self.large_out_seq_at {
            if let Some(slot) = &self.window[self.idx(s)] {
                if slot.packet.borrow().seq == Some(s) {
                    unacked.push((s, slot));
                }
            }
            s = s.next();
        }
        buf.put_usize_varint(unacked.len());
        for (seq, slot) in unacked {
            buf.put_u32(seq.to_raw());
            slot.packet
                .borrow()
                .add_to_stream(buf, PacketStreamState::UnackedSend);
            put_ranges(buf, &slot.reliable_ranges);
        }

        buf.put_usize_varint(self.overflow.len());
        for entry in &self.overflow {
            buf.put_u32(entry.seq.to_raw());
            entry
                .packet
                .borrow()
                .add_to_stream(buf, PacketStreamState::UnackedSend);
            put_ranges(buf, &entry.reliable_ranges);
        }

        buf.put_usize_varint(self.num_buffered as usize);
        for slot in self.buffered_receives.iter().flatten() {
            slot.borrow()
                .add_to_stream(buf, PacketStreamState::BufferedReceive);
        }

        match &self.fragments {
            Some(fb) => {
                buf.put_u8(1);
                let (first, last) = fb.span();
                buf.put_u32(first.to_raw());
                buf.put_u32(last.to_raw());
                buf.put_usize_varint(fb.packets().len());
                for p in fb.packets() {
                    p.borrow()
                        .add_to_stream(buf, PacketStreamState::ChainedFragment);
                }
            }
            None => buf.put_u8(0),
        }
    }

    /// Restores protocol state serialized by [Channel::add_to_stream] onto
    ///  a freshly created channel. All restored packets count as sent just
    ///  now, so resend timing restarts cleanly on the new hub.
    pub fn init_from_stream(&mut self, buf: &mut impl Buf) -> Result<(), Reason> {
        let now = Instant::now();

        if buf.remaining() < 24 {
            return Err(Reason::CorruptedPacket);
        }
        self.version = buf.get_u32();
        self.small_out_seq_at = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
        self.large_out_seq_at = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
        self.in_seq_at = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
        self.last_ack = match buf.get_u32() {
            u32::MAX => None,
            raw => Some(SeqNum::from_wire(raw).ok_or(Reason::CorruptedPacket)?),
        };
        self.unacked_critical_seq = match buf.get_u32() {
            u32::MAX => None,
            raw => Some(SeqNum::from_wire(raw).ok_or(Reason::CorruptedPacket)?),
        };
        self.wants_first_packet = false;

        let num_unacked = buf
            .try_get_usize_varint()
            .map_err(|_| Reason::CorruptedPacket)?;
        for _ in 0..num_unacked {
            if buf.remaining() < 4 {
                return Err(Reason::CorruptedPacket);
            }
            let seq = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
            let packet = Packet::from_stream(buf, PacketStreamState::UnackedSend)
                .ok_or(Reason::CorruptedPacket)?;
            let ranges = get_ranges(buf).ok_or(Reason::CorruptedPacket)?;
            let idx = self.idx(seq);
            self.window[idx] = Some(WindowSlot {
                packet: Rc::new(std::cell::RefCell::new(packet)),
                reliable_ranges: ranges,
                first_sent: now,
                last_sent: now,
                last_sent_at_out_seq: self.large_out_seq_at,
                was_resent: false,
                in_missing: false,
                next_missing: None,
            });
            self.num_unacked += 1;
        }

        let num_overflow = buf
            .try_get_usize_varint()
            .map_err(|_| Reason::CorruptedPacket)?;
        for _ in 0..num_overflow {
            if buf.remaining() < 4 {
                return Err(Reason::CorruptedPacket);
            }
            let seq = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
            let packet = Packet::from_stream(buf, PacketStreamState::UnackedSend)
                .ok_or(Reason::CorruptedPacket)?;
            let ranges = get_ranges(buf).ok_or(Reason::CorruptedPacket)?;
            self.overflow.push_back(OverflowPacket {
                seq,
                packet: Rc::new(std::cell::RefCell::new(packet)),
                reliable_ranges: ranges,
            });
            self.num_unacked += 1;
        }

        let num_buffered = buf
            .try_get_usize_varint()
            .map_err(|_| Reason::CorruptedPacket)?;
        for _ in 0..num_buffered {
            let packet = Packet::from_stream(buf, PacketStreamState::BufferedReceive)
                .ok_or(Reason::CorruptedPacket)?;
            let seq = packet.seq.ok_or(Reason::CorruptedPacket)?;
            let idx = self.idx(seq);
            self.buffered_receives[idx] = Some(Rc::new(std::cell::RefCell::new(packet)));
            self.num_buffered += 1;
        }

        if buf.remaining() < 1 {
            return Err(Reason::CorruptedPacket);
        }
        if buf.get_u8() == 1 {
            if buf.remaining() < 8 {
                return Err(Reason::CorruptedPacket);
            }
            let first = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
            let last = SeqNum::from_wire(buf.get_u32()).ok_or(Reason::CorruptedPacket)?;
            let mut fb = FragmentedBundle::new((first, last));
            let n = buf
                .try_get_usize_varint()
                .map_err(|_| Reason::CorruptedPacket)?;
            for _ in 0..n {
                let packet = Packet::from_stream(buf, PacketStreamState::ChainedFragment)
                    .ok_or(Reason::CorruptedPacket)?;
                fb.restore_packet(Rc::new(std::cell::RefCell::new(packet)));
            }
            self.fragments = Some(fb);
        }
        Ok(())
    }
}

fn seq_in_range(seq: SeqNum, small: SeqNum, large: SeqNum) -> bool {
    seq.dist_after(small) < large.dist_after(small)
}

fn put_ranges(buf: &mut BytesMut, ranges: &[Range<usize>]) {
    buf.put_usize_varint(ranges.len());
    for r in ranges {
        buf.put_usize_varint(r.start);
        buf.put_usize_varint(r.end);
    }
}

fn get_ranges(buf: &mut impl Buf) -> Option<Vec<Range<usize>>> {
    let n = buf.try_get_usize_varint().ok()?;
    if n > Packet::MAX_SIZE {
        return None;
    }
    let mut ranges = Vec::with_capacity(n);
    for _ in 0..n {
        let start = buf.try_get_usize_varint().ok()?;
        let end = buf.try_get_usize_varint().ok()?;
        if start > end || end > Packet::MAX_SIZE {
            return None;
        }
        ranges.push(start..end);
    }
    Some(ranges)
}
