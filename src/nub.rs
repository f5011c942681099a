use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bundle::{Bundle, MessageWalker, ReliableType, ReplyOrder, WalkError, MAX_ACKS_PER_PACKET};
use crate::channel::{AddResend, Channel, ChannelId, ChannelPtr, IncomingDecision, PromotedSend};
use crate::condemned::{CondemnedChannels, IrregularChannels};
use crate::config::{ChannelCategory, NubConfig};
use crate::endpoint::DatagramSocket;
use crate::err_report::ErrorReporter;
use crate::error::{NetworkError, Reason};
use crate::filter::PacketFilter;
use crate::fragment::{FragmentAdd, FragmentedBundle};
use crate::interface::{
    IncomingMessage, InterfaceElement, InterfaceTable, MessageHandler, ReplyId,
    ReplyMessageHandler, TimerExpiryHandler, REPLY_MESSAGE_IDENTIFIER,
};
use crate::packet::{Packet, PacketFlags, PacketPtr};
use crate::seq::SeqNum;
use crate::timer::{TimerAction, TimerId, TimerQueue};

/// Requests sent off-channel fall back to this timeout when the caller
///  does not give one. On-channel requests have no timer at all, channel
///  liveness subsumes them.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_FRAGMENTS_PER_BUNDLE: u32 = 4096;

/// Resolves indexed channels the hub does not hold in its own registry,
///  e.g. channels owned by application entities.
pub trait ChannelFinder {
    fn find_indexed(&self, id: ChannelId, from: SocketAddr) -> Option<ChannelPtr>;
}

struct ReplyRecord {
    handler: Rc<dyn ReplyMessageHandler>,
    addr: SocketAddr,
    timer: Option<TimerId>,
    channel_bound: bool,
}

struct OnceOffSend {
    datagram: Vec<u8>,
    resends_left: u32,
    timer: TimerId,
}

/// The hub: owns the socket, the timer queue and all protocol state, and
///  runs everything on one thread. Handlers are called inline from the
///  event loop and get `&mut Nub` back, so they can send without locks.
pub struct Nub {
    config: NubConfig,
    socket: Arc<dyn DatagramSocket>,
    filter: Option<Arc<dyn PacketFilter>>,
    interface: InterfaceTable,
    timers: TimerQueue,

    channels: FxHashMap<SocketAddr, ChannelPtr>,
    indexed_channels: FxHashMap<ChannelId, ChannelPtr>,
    channel_finder: Option<Rc<dyn ChannelFinder>>,
    condemned: CondemnedChannels,
    irregular: IrregularChannels,

    reply_handlers: FxHashMap<ReplyId, ReplyRecord>,
    next_reply_id: ReplyId,

    next_off_channel_seq: SeqNum,
    once_off_sends: FxHashMap<(SocketAddr, SeqNum), OnceOffSend>,
    once_off_receipts: FxHashSet<(SocketAddr, SeqNum)>,
    prev_once_off_receipts: FxHashSet<(SocketAddr, SeqNum)>,

    fragments: FxHashMap<(SocketAddr, SeqNum), FragmentedBundle>,

    rng: StdRng,
    artificial_send_count: u64,
    delayed_sends: FxHashMap<u64, (SocketAddr, Vec<u8>)>,
    next_delay_key: u64,

    err_reporter: ErrorReporter,

    break_requested: bool,
    break_notify: Arc<Notify>,

    children: Vec<Nub>,

    // channels that accumulated acks while processing the current datagram
    ack_flush_queue: Vec<ChannelPtr>,

    num_packets_sent: u32,
    num_packets_received: u32,
    num_corrupted_packets_received: u32,
    num_once_off_duplicates: u32,
}

impl Nub {
    pub fn new(config: NubConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Nub> {
        config.validate()?;

        let mut timers = TimerQueue::new();
        timers.add_repeating(
            config.irregular_check_period,
            TimerAction::IrregularResendCheck,
        );
        timers.add_repeating(config.condemned_check_period, TimerAction::CondemnedCheck);
        timers.add_repeating(config.fragment_max_age, TimerAction::FragmentReaper);
        timers.add_repeating(config.err_report_flush_period, TimerAction::ErrReportFlush);
        timers.add_repeating(
            config.once_off_receipt_lifetime,
            TimerAction::OnceOffReceiptAgeOut,
        );

        let err_reporter =
            ErrorReporter::new(config.err_report_flush_period, config.err_report_idle_age);
        let rng = StdRng::seed_from_u64(config.artificial_seed);

        Ok(Nub {
            config,
            socket,
            filter: None,
            interface: InterfaceTable::new(),
            timers,
            channels: FxHashMap::default(),
            indexed_channels: FxHashMap::default(),
            channel_finder: None,
            condemned: CondemnedChannels::new(),
            irregular: IrregularChannels::new(),
            reply_handlers: FxHashMap::default(),
            next_reply_id: 1,
            next_off_channel_seq: SeqNum::ZERO,
            once_off_sends: FxHashMap::default(),
            once_off_receipts: FxHashSet::default(),
            prev_once_off_receipts: FxHashSet::default(),
            fragments: FxHashMap::default(),
            rng,
            artificial_send_count: 0,
            delayed_sends: FxHashMap::default(),
            next_delay_key: 1,
            err_reporter,
            break_requested: false,
            break_notify: Arc::new(Notify::new()),
            children: Vec::new(),
            ack_flush_queue: Vec::new(),
            num_packets_sent: 0,
            num_packets_received: 0,
            num_corrupted_packets_received: 0,
            num_once_off_duplicates: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn serve(&mut self, element: InterfaceElement, handler: Rc<dyn MessageHandler>) {
        self.interface.serve(element, handler);
    }

    pub fn set_filter(&mut self, filter: Arc<dyn PacketFilter>) {
        self.filter = Some(filter);
    }

    pub fn set_channel_finder(&mut self, finder: Rc<dyn ChannelFinder>) {
        self.channel_finder = Some(finder);
    }

    // ---- channel registry ----------------------------------------------

    pub fn create_channel(&mut self, addr: SocketAddr) -> ChannelPtr {
        let category = if self.config.is_external {
            ChannelCategory::External
        } else {
            ChannelCategory::Internal
        };
        let channel = Channel::new_ptr(
            addr,
            None,
            self.config.effective_channel_config(category),
            self.config.send_window_callback.clone(),
        );
        self.channels.insert(addr, channel.clone());
        channel
    }

    pub fn create_indexed_channel(&mut self, id: ChannelId, addr: SocketAddr) -> ChannelPtr {
        let channel = Channel::new_ptr(
            addr,
            Some(id),
            self.config.effective_channel_config(ChannelCategory::Indexed),
            self.config.send_window_callback.clone(),
        );
        self.indexed_channels.insert(id, channel.clone());
        channel
    }

    pub fn find_channel(&self, addr: SocketAddr) -> Option<ChannelPtr> {
        self.channels.get(&addr).cloned()
    }

    pub fn find_indexed_channel(&self, id: ChannelId) -> Option<ChannelPtr> {
        self.indexed_channels.get(&id).cloned()
    }

    pub fn register_irregular(&mut self, channel: &ChannelPtr) {
        self.irregular.add(channel.clone());
    }

    /// Detaches a channel from the registry and lets it drain its unacked
    ///  data before destruction. Pending channel-bound requests to that
    ///  peer fail with `ChannelLost`.
    pub fn condemn_channel(&mut self, addr: SocketAddr) -> bool {
        let Some(channel) = self
            .channels
            .remove(&addr)
            .or_else(|| {
                let id = self.indexed_channels.iter().find_map(|(id, ch)| {
                    (ch.borrow().peer_addr() == addr).then_some(*id)
                })?;
                self.indexed_channels.remove(&id)
            })
        else {
            return false;
        };
        self.condemned.add(channel);
        self.fail_channel_bound_requests(addr);
        true
    }

    fn fail_channel_bound_requests(&mut self, addr: SocketAddr) {
        let lost: Vec<ReplyId> = self
            .reply_handlers
            .iter()
            .filter(|(_, r)| r.channel_bound && r.addr == addr)
            .map(|(id, _)| *id)
            .collect();
        for reply_id in lost {
            if let Some(record) = self.reply_handlers.remove(&reply_id) {
                if let Some(timer) = record.timer {
                    self.timers.cancel(timer);
                }
                record
                    .handler
                    .handle_exception(self, NetworkError::at(Reason::ChannelLost, addr));
            }
        }
    }

    // ---- timers for the application ------------------------------------

    pub fn add_timer(&mut self, delay: Duration, handler: Rc<dyn TimerExpiryHandler>) -> TimerId {
        self.timers.add_once(delay, TimerAction::User(handler))
    }

    pub fn add_repeating_timer(
        &mut self,
        interval: Duration,
        handler: Rc<dyn TimerExpiryHandler>,
    ) -> TimerId {
        self.timers.add_repeating(interval, TimerAction::User(handler))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    // ---- sending -------------------------------------------------------

    /// A bundle sized for the given destination; indexed channels reserve
    ///  extra footer space for the channel id on every packet.
    pub fn start_bundle(channel: Option<&ChannelPtr>) -> Bundle {
        match channel {
            Some(ch) if ch.borrow().is_indexed() => Bundle::with_extra_footer(8),
            _ => Bundle::new(),
        }
    }

    /// Sends a bundle to a bare address: on the peer's channel if one is
    ///  registered, otherwise off-channel (reliable traffic then uses the
    ///  once-off reliable machinery).
    pub fn send(&mut self, addr: SocketAddr, bundle: &mut Bundle) -> Result<(), NetworkError> {
        match self.channels.get(&addr).cloned() {
            Some(channel) => self.send_bundle(addr, bundle, Some(channel)),
            None => self.send_bundle(addr, bundle, None),
        }
    }

    pub fn send_on_channel(
        &mut self,
        channel: &ChannelPtr,
        bundle: &mut Bundle,
    ) -> Result<(), NetworkError> {
        let addr = channel.borrow().peer_addr();
        self.send_bundle(addr, bundle, Some(channel.clone()))
    }

    /// Answers a request received through [IncomingMessage::reply_id]. The
    ///  reply goes on the peer's channel when one exists.
    pub fn send_reply(
        &mut self,
        addr: SocketAddr,
        reply_id: ReplyId,
        payload: &[u8],
    ) -> Result<(), NetworkError> {
        let channel = self.channels.get(&addr).cloned();
        let reliable = if channel.is_some() || !self.config.is_external {
            ReliableType::Driver
        } else {
            ReliableType::Unreliable
        };
        let mut bundle = Self::start_bundle(channel.as_ref());
        bundle.start_reply(reply_id, reliable);
        bundle.add_bytes(payload);
        self.send_bundle(addr, &mut bundle, channel)
    }

    /// Forces an immediate resend of all unacked packets up to the critical
    ///  watermark.
    pub fn resend_criticals(&mut self, channel: &ChannelPtr) {
        let due = channel.borrow().critical_resends();
        self.resend_direct(channel, due);
    }

    fn send_bundle(
        &mut self,
        addr: SocketAddr,
        bundle: &mut Bundle,
        channel: Option<ChannelPtr>,
    ) -> Result<(), NetworkError> {
        let now = Instant::now();

        match &channel {
            Some(channel) => {
                if channel.borrow().is_condemned() {
                    return Err(NetworkError::at(Reason::ChannelLost, addr));
                }
                if let Some(reason) = channel.borrow().remote_failure() {
                    return Err(NetworkError::at(reason, addr));
                }
                // ride queued acks along with this bundle
                for ack in channel.borrow_mut().take_pending_acks() {
                    bundle.add_ack(ack);
                }
            }
            None => {
                if bundle.is_reliable() && self.config.is_external {
                    return Err(NetworkError::at(Reason::ResourceUnavailable, addr));
                }
            }
        }
        bundle.finalise();

        self.assign_reply_ids(addr, bundle, channel.as_ref());

        let reliable = bundle.is_reliable();
        let is_fragmented = bundle.num_packets() > 1;
        let needs_seq = reliable || is_fragmented;

        // sequence allocation, all packets upfront so the fragment span is
        // known before any footer is written
        let seqs: Vec<Option<SeqNum>> = (0..bundle.num_packets())
            .map(|_| {
                if !needs_seq {
                    return None;
                }
                Some(match (&channel, reliable) {
                    (Some(ch), true) => ch.borrow_mut().use_next_sequence_id(),
                    _ => {
                        let seq = self.next_off_channel_seq;
                        self.next_off_channel_seq = self.next_off_channel_seq.next();
                        seq
                    }
                })
            })
            .collect();
        let frag_span = if is_fragmented {
            Some((seqs[0].unwrap(), seqs[bundle.num_packets() - 1].unwrap()))
        } else {
            None
        };

        if bundle.is_critical() {
            if let Some(channel) = &channel {
                channel.borrow_mut().mark_critical();
            }
        }

        let create_channel = channel
            .as_ref()
            .map(|ch| ch.borrow_mut().take_wants_first_packet())
            .unwrap_or(false);

        for (idx, packet) in bundle.packets().iter().enumerate() {
            self.write_packet_footers(
                packet,
                bundle,
                idx,
                seqs[idx],
                frag_span,
                channel.as_ref(),
                create_channel,
            );
        }

        // window registration first, so slots reclaimed while piggybacking
        // cannot advance the window past this bundle's own sequence numbers;
        // an overflow stops transmission of that packet and everything
        // after it
        let mut transmit_blocked_from = None;
        if reliable {
            if let Some(channel) = &channel {
                for (idx, packet) in bundle.packets().iter().enumerate() {
                    let outcome = channel.borrow_mut().add_resend_timer(
                        seqs[idx].unwrap(),
                        packet.clone(),
                        bundle.reliable_ranges_for(idx),
                        now,
                    );
                    match outcome {
                        AddResend::Windowed => {}
                        AddResend::Overflowed => {
                            transmit_blocked_from.get_or_insert(idx);
                        }
                        AddResend::Failed(reason) => {
                            self.err_reporter
                                .report(Some(addr), "send window overflowed hard");
                            return Err(NetworkError::at(reason, addr));
                        }
                    }
                }
            }
        }

        // lost reliable data from this channel hitches a ride before the
        // checksums seal the packets
        if let Some(channel) = &channel {
            let due = channel.borrow_mut().check_resend_timers(now);
            self.resend_with_piggyback_preference(channel, bundle, due, now);
        }

        for packet in bundle.packets() {
            let mut p = packet.borrow_mut();
            p.enable_flags(PacketFlags::HAS_CHECKSUM);
            p.append_checksum();
        }

        for (idx, packet) in bundle.packets().iter().enumerate() {
            if reliable && channel.is_none() {
                // the once-off image must include the checksum
                self.register_once_off(addr, seqs[idx].unwrap(), packet);
            }
            if transmit_blocked_from.map(|b| idx >= b).unwrap_or(false) {
                continue;
            }
            self.transmit(addr, packet);
        }
        Ok(())
    }

    fn assign_reply_ids(
        &mut self,
        addr: SocketAddr,
        bundle: &mut Bundle,
        channel: Option<&ChannelPtr>,
    ) {
        for order in bundle.take_reply_orders() {
            let ReplyOrder {
                handler,
                timeout,
                packet_idx,
                reply_id_offset,
            } = order;

            let reply_id = self.next_reply_id;
            self.next_reply_id = self.next_reply_id.wrapping_add(1).max(1);

            bundle.packets()[packet_idx]
                .borrow_mut()
                .write_u32_at(reply_id_offset, reply_id);

            let channel_bound = channel.is_some();
            let timer = if channel_bound {
                if timeout.is_some() {
                    warn!(
                        "request timeout on a channel to {} ignored, channel liveness covers it",
                        addr
                    );
                }
                None
            } else {
                let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
                Some(
                    self.timers
                        .add_once(timeout, TimerAction::ReplyTimeout(reply_id)),
                )
            };

            self.reply_handlers.insert(
                reply_id,
                ReplyRecord {
                    handler,
                    addr,
                    timer,
                    channel_bound,
                },
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_packet_footers(
        &mut self,
        packet: &PacketPtr,
        bundle: &Bundle,
        idx: usize,
        seq: Option<SeqNum>,
        frag_span: Option<(SeqNum, SeqNum)>,
        channel: Option<&ChannelPtr>,
        create_channel: bool,
    ) {
        let mut p = packet.borrow_mut();

        if let Some(span) = frag_span {
            p.fragment_span = Some(span);
            p.append_footer_u32(span.0.to_raw());
            p.append_footer_u32(span.1.to_raw());
        }
        if p.has_flags(PacketFlags::HAS_REQUESTS) {
            let offset = p.first_request_offset.unwrap_or(0);
            p.append_footer_u16(offset);
        }
        if let Some(seq) = seq {
            p.seq = Some(seq);
            p.append_footer_u32(seq.to_raw());
        }

        let acks: Vec<SeqNum> = bundle.acks_for(idx).collect();
        if !acks.is_empty() {
            debug_assert!(acks.len() <= MAX_ACKS_PER_PACKET);
            for ack in acks.iter().rev() {
                p.append_footer_u32(ack.to_raw());
            }
            p.append_footer_u8(acks.len() as u8);
        }

        if let Some(channel) = channel {
            p.enable_flags(PacketFlags::ON_CHANNEL);
            if create_channel {
                p.enable_flags(PacketFlags::CREATE_CHANNEL);
            }
            let ch = channel.borrow();
            if let Some(id) = ch.id() {
                p.enable_flags(PacketFlags::INDEXED_CHANNEL);
                p.append_footer_u32(ch.version());
                p.append_footer_u32(id);
            }
        }
    }

    // ---- resending and piggybacking ------------------------------------

    fn resend_with_piggyback_preference(
        &mut self,
        channel: &ChannelPtr,
        bundle: &Bundle,
        due: Vec<SeqNum>,
        now: Instant,
    ) {
        let mut direct = Vec::new();
        for seq in due {
            let Some(info) = channel.borrow().resend_info(seq) else {
                continue;
            };

            let whole_body_reliable = {
                let p = info.packet.borrow();
                info.reliable_ranges.len() == 1
                    && info.reliable_ranges[0] == (Packet::BODY_OFFSET..p.msg_end())
            };
            if !(info.can_piggyback && whole_body_reliable) {
                direct.push(seq);
                continue;
            }

            let block = Self::build_piggyback_block(&info.packet, seq);
            let mut appended = false;
            for packet in bundle.packets() {
                let mut p = packet.borrow_mut();
                // the block, its length field, and the pending checksum all
                // have to fit
                if p.len() + block.len() + 2 + 4 <= Packet::MAX_SIZE {
                    let start = p.len();
                    let first_on_packet = !p.has_flags(PacketFlags::HAS_PIGGYBACKS);
                    p.append_footer_bytes(&block);
                    let len = block.len() as i16;
                    let wire_len = if first_on_packet { !len } else { len };
                    p.append_footer_u16(wire_len as u16);
                    p.enable_flags(PacketFlags::HAS_PIGGYBACKS);
                    let end = p.len();
                    p.piggy_footer_range = Some(match p.piggy_footer_range.take() {
                        Some(range) => range.start..end,
                        None => start..end,
                    });
                    appended = true;
                    break;
                }
            }

            if appended {
                trace!("piggybacked lost packet {} to {}", seq, channel.borrow().peer_addr());
                let promoted = channel.borrow_mut().remove_for_piggyback(seq, now);
                self.transmit_promoted(channel, promoted);
            } else {
                direct.push(seq);
            }
        }
        self.resend_direct(channel, direct);
    }

    /// The wire image of a lost packet as it travels inside a live one:
    ///  flags, body, and the footers the receiver's strip loop will look
    ///  for, minus acks and checksum which only make sense on a real frame.
    fn build_piggyback_block(packet: &PacketPtr, seq: SeqNum) -> Vec<u8> {
        let p = packet.borrow();
        let mut flags =
            PacketFlags::ON_CHANNEL | PacketFlags::IS_RELIABLE | PacketFlags::HAS_SEQUENCE_NUMBER;
        if p.first_request_offset.is_some() {
            flags |= PacketFlags::HAS_REQUESTS;
        }
        // a channel-creating packet must still create the channel when it
        // arrives inside another one
        if p.has_flags(PacketFlags::CREATE_CHANNEL) {
            flags |= PacketFlags::CREATE_CHANNEL;
        }
        let sub = p.piggy_footer_range.clone();
        if sub.is_some() {
            flags |= PacketFlags::HAS_PIGGYBACKS;
        }

        let mut block = Vec::with_capacity(p.msg_end() + 16);
        block.extend_from_slice(&flags.bits().to_be_bytes());
        block.extend_from_slice(p.body());
        if let Some(offset) = p.first_request_offset {
            block.extend_from_slice(&offset.to_be_bytes());
        }
        block.extend_from_slice(&seq.to_raw().to_be_bytes());
        if let Some(range) = sub {
            block.extend_from_slice(p.bytes_at(range));
        }
        block
    }

    fn resend_direct(&mut self, channel: &ChannelPtr, seqs: Vec<SeqNum>) {
        let now = Instant::now();
        let addr = channel.borrow().peer_addr();
        for seq in seqs {
            let Some(info) = channel.borrow().resend_info(seq) else {
                continue;
            };
            channel.borrow_mut().mark_resent(seq, now);
            trace!("resending {} to {}", seq, addr);
            self.transmit(addr, &info.packet);
        }
    }

    fn transmit_promoted(&mut self, channel: &ChannelPtr, promoted: Vec<PromotedSend>) {
        let addr = channel.borrow().peer_addr();
        for send in promoted {
            self.transmit(addr, &send.packet);
        }
    }

    // ---- once-off reliable ---------------------------------------------

    fn register_once_off(&mut self, addr: SocketAddr, seq: SeqNum, packet: &PacketPtr) {
        let timer = self.timers.add_repeating(
            self.config.once_off_resend_period,
            TimerAction::OnceOffResend(addr, seq),
        );
        self.once_off_sends.insert(
            (addr, seq),
            OnceOffSend {
                datagram: packet.borrow().wire_bytes().to_vec(),
                resends_left: self.config.once_off_max_resends,
                timer,
            },
        );
    }

    fn on_once_off_resend_due(&mut self, addr: SocketAddr, seq: SeqNum) {
        let Some(entry) = self.once_off_sends.get_mut(&(addr, seq)) else {
            return;
        };
        if entry.resends_left == 0 {
            let timer = entry.timer;
            self.once_off_sends.remove(&(addr, seq));
            self.timers.cancel(timer);
            self.err_reporter
                .report(Some(addr), "once-off reliable send abandoned");
            return;
        }
        entry.resends_left -= 1;
        let datagram = entry.datagram.clone();
        trace!("resending once-off {} to {}", seq, addr);
        self.transmit_raw(addr, datagram);
    }

    fn ack_once_off(&mut self, addr: SocketAddr, seq: SeqNum) {
        if let Some(entry) = self.once_off_sends.remove(&(addr, seq)) {
            self.timers.cancel(entry.timer);
        }
    }

    fn once_off_seen_before(&mut self, addr: SocketAddr, seq: SeqNum) -> bool {
        let key = (addr, seq);
        if self.once_off_receipts.contains(&key) || self.prev_once_off_receipts.contains(&key) {
            return true;
        }
        self.once_off_receipts.insert(key);
        false
    }

    // ---- raw transmission with loss/latency injection ------------------

    fn transmit(&mut self, addr: SocketAddr, packet: &PacketPtr) {
        let datagram = packet.borrow().wire_bytes().to_vec();
        self.transmit_raw(addr, datagram);
    }

    fn transmit_raw(&mut self, addr: SocketAddr, datagram: Vec<u8>) {
        if self.config.artificial_drop_per_n > 0 {
            self.artificial_send_count += 1;
            if self.artificial_send_count % self.config.artificial_drop_per_n as u64 == 0 {
                debug!("artificially dropping datagram to {}", addr);
                return;
            }
        }
        if let Some((min, spread)) = self.config.artificial_latency {
            let delay = min + spread.mul_f64(self.rng.gen::<f64>());
            let key = self.next_delay_key;
            self.next_delay_key += 1;
            self.delayed_sends.insert(key, (addr, datagram));
            self.timers.add_once(delay, TimerAction::ArtificialDelay(key));
            return;
        }
        self.transmit_now(addr, datagram);
    }

    fn transmit_now(&mut self, addr: SocketAddr, mut datagram: Vec<u8>) {
        if let Some(filter) = &self.filter {
            if filter.filter_outgoing(&mut datagram).is_err() {
                self.err_reporter
                    .report(Some(addr), "outgoing packet filter failed");
                return;
            }
        }
        match self.socket.try_send_to(addr, &datagram) {
            Ok(()) => self.num_packets_sent += 1,
            Err(e) => {
                self.err_reporter
                    .report(Some(addr), &format!("socket send error: {}", e));
                self.mark_remote_failed(addr);
            }
        }
    }

    /// A refused send means nothing is listening at the peer address. The
    ///  channel there, if any, is poisoned so the owner finds out on its
    ///  next send instead of resending into the void.
    fn mark_remote_failed(&mut self, addr: SocketAddr) {
        let channel = self
            .channels
            .get(&addr)
            .cloned()
            .or_else(|| {
                self.indexed_channels
                    .values()
                    .find(|c| c.borrow().peer_addr() == addr)
                    .cloned()
            })
            .or_else(|| self.condemned.find(addr));
        if let Some(channel) = channel {
            channel.borrow_mut().set_remote_failure(Reason::NoSuchPort);
        }
    }

    // ---- event loop ----------------------------------------------------

    /// Runs the hub until [Nub::break_processing] is called from a handler
    ///  or timer.
    pub async fn process_continuously(&mut self) {
        loop {
            self.process_expired_timers();
            self.poll_children();
            if self.break_requested {
                self.break_requested = false;
                return;
            }

            let deadline = self.timers.next_deadline();
            let socket = self.socket.clone();
            let notify = self.break_notify.clone();
            tokio::select! {
                _ = socket.readable() => {
                    self.receive_burst();
                }
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {}
                _ = notify.notified() => {}
            }
        }
    }

    /// One non-blocking pass: expired timers, whatever sits in the socket
    ///  buffer, and the child hubs. The master hub drives its children's
    ///  traffic through this.
    pub fn process_pending_events(&mut self) {
        self.process_expired_timers();
        self.receive_burst();
        self.poll_children();
    }

    /// Makes [Nub::process_continuously] return after the current
    ///  iteration. Safe to call from handlers; a waiting loop is woken.
    pub fn break_processing(&mut self) {
        self.break_requested = true;
        self.break_notify.notify_one();
    }

    pub fn register_child_nub(&mut self, child: Nub) {
        if self.children.is_empty() {
            self.timers.add_repeating(
                self.config.irregular_check_period,
                TimerAction::ChildNubPoll,
            );
        }
        self.children.push(child);
    }

    pub fn deregister_child_nub(&mut self, addr: SocketAddr) -> Option<Nub> {
        let idx = self.children.iter().position(|c| c.local_addr() == addr)?;
        Some(self.children.remove(idx))
    }

    fn poll_children(&mut self) {
        let mut children = std::mem::take(&mut self.children);
        for child in &mut children {
            child.process_pending_events();
        }
        self.children = children;
    }

    fn process_expired_timers(&mut self) {
        let now = Instant::now();
        while let Some((id, action)) = self.timers.pop_expired(now) {
            self.handle_timer(id, action, now);
        }
    }

    fn handle_timer(&mut self, id: TimerId, action: TimerAction, now: Instant) {
        match action {
            TimerAction::ReplyTimeout(reply_id) => {
                if let Some(record) = self.reply_handlers.remove(&reply_id) {
                    debug!("request {} to {} timed out", reply_id, record.addr);
                    record
                        .handler
                        .handle_exception(self, NetworkError::at(Reason::TimerExpired, record.addr));
                }
            }
            TimerAction::OnceOffResend(addr, seq) => self.on_once_off_resend_due(addr, seq),
            TimerAction::ArtificialDelay(key) => {
                if let Some((addr, datagram)) = self.delayed_sends.remove(&key) {
                    self.transmit_now(addr, datagram);
                }
            }
            TimerAction::IrregularResendCheck => {
                let work = self.irregular.tick(now);
                for (channel, due) in work {
                    self.resend_direct(&channel, due);
                }
            }
            TimerAction::CondemnedCheck => {
                let work = self.condemned.collect_resends(now);
                for (channel, due) in work {
                    self.resend_direct(&channel, due);
                }
                for channel in self.condemned.reap(now, self.config.condemned_max_age) {
                    debug!("condemned channel to {} destroyed", channel.borrow().peer_addr());
                }
            }
            TimerAction::FragmentReaper => {
                let max_age = self.config.fragment_max_age;
                self.fragments.retain(|(addr, _), fb| {
                    let stale = fb.is_stale(now, max_age);
                    if stale {
                        warn!("discarding stale fragmented bundle from {}", addr);
                    }
                    !stale
                });
            }
            TimerAction::ErrReportFlush => {
                self.err_reporter.flush();
            }
            TimerAction::OnceOffReceiptAgeOut => {
                self.prev_once_off_receipts = std::mem::take(&mut self.once_off_receipts);
            }
            TimerAction::ChildNubPoll => {
                // polling happens in the loop body; the timer only bounds
                // how long the select may sleep while children have work
            }
            TimerAction::User(handler) => handler.handle_timeout(self, id),
        }
    }

    // ---- receiving -----------------------------------------------------

    fn receive_burst(&mut self) {
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok(Some((n, from))) => self.process_datagram(from, &buf[..n]),
                Ok(None) => return,
                Err(e) => {
                    self.err_reporter
                        .report(None, &format!("socket receive error: {}", e));
                    return;
                }
            }
        }
    }

    /// Entry point for one received datagram, also used by tests to inject
    ///  traffic without a socket.
    pub fn process_datagram(&mut self, from: SocketAddr, data: &[u8]) {
        self.num_packets_received += 1;

        let mut data = data.to_vec();
        if let Some(filter) = &self.filter {
            if filter.filter_incoming(&mut data).is_err() {
                self.corrupted(from, "incoming packet filter rejected datagram");
                return;
            }
        }

        let Some(packet) = Packet::from_datagram(&data) else {
            self.corrupted(from, "undersized or oversized datagram");
            return;
        };
        let packet = Rc::new(std::cell::RefCell::new(packet));
        self.process_packet(from, packet, true);

        // acks accumulated while processing go out at once
        let pending: Vec<ChannelPtr> = std::mem::take(&mut self.ack_flush_queue);
        for channel in pending {
            if channel.borrow().has_pending_acks() {
                let mut acks_bundle = Self::start_bundle(Some(&channel));
                if self.send_on_channel(&channel, &mut acks_bundle).is_err() {
                    warn!("failed to send acks to {}", channel.borrow().peer_addr());
                }
            }
        }
    }

    fn process_packet(&mut self, from: SocketAddr, packet: PacketPtr, checksummed: bool) {
        let flags = packet.borrow().flags();
        if !(flags - PacketFlags::all()).is_empty() {
            self.corrupted(from, "packet with unknown flags");
            return;
        }

        // strip footers back to front; each is announced by a flag
        let mut piggyback_blocks: Vec<Vec<u8>> = Vec::new();
        let mut acks: Vec<SeqNum> = Vec::new();
        let mut indexed: Option<(u32, ChannelId)> = None;
        {
            let mut p = packet.borrow_mut();

            if flags.contains(PacketFlags::HAS_CHECKSUM) {
                if !checksummed || !p.strip_checksum() {
                    drop(p);
                    self.corrupted(from, "checksum mismatch");
                    return;
                }
            }

            if flags.contains(PacketFlags::HAS_PIGGYBACKS) {
                loop {
                    let Some(raw_len) = p.strip_u16() else {
                        drop(p);
                        self.corrupted(from, "truncated piggyback footer");
                        return;
                    };
                    let raw_len = raw_len as i16;
                    let terminal = raw_len < 0;
                    let len = if terminal { !raw_len } else { raw_len } as usize;
                    let Some(region) = p.strip_region(len) else {
                        drop(p);
                        self.corrupted(from, "truncated piggyback block");
                        return;
                    };
                    piggyback_blocks.push(p.bytes_at(region).to_vec());
                    if terminal {
                        break;
                    }
                }
            }

            if flags.contains(PacketFlags::INDEXED_CHANNEL) {
                let (Some(id), Some(version)) = (p.strip_u32(), p.strip_u32()) else {
                    drop(p);
                    self.corrupted(from, "truncated channel id footer");
                    return;
                };
                p.channel_id = Some(id);
                p.channel_version = Some(version);
                indexed = Some((version, id));
            }

            if flags.contains(PacketFlags::HAS_ACKS) {
                let Some(count) = p.strip_u8() else {
                    drop(p);
                    self.corrupted(from, "truncated ack footer");
                    return;
                };
                for _ in 0..count {
                    let Some(raw) = p.strip_u32() else {
                        drop(p);
                        self.corrupted(from, "truncated ack footer");
                        return;
                    };
                    let Some(seq) = SeqNum::from_wire(raw) else {
                        drop(p);
                        self.corrupted(from, "ack with invalid sequence number");
                        return;
                    };
                    acks.push(seq);
                }
            }

            if flags.contains(PacketFlags::HAS_SEQUENCE_NUMBER) {
                let seq = p.strip_u32().and_then(SeqNum::from_wire);
                let Some(seq) = seq else {
                    drop(p);
                    self.corrupted(from, "invalid sequence number footer");
                    return;
                };
                p.seq = Some(seq);
            }

            if flags.contains(PacketFlags::HAS_REQUESTS) {
                let Some(offset) = p.strip_u16() else {
                    drop(p);
                    self.corrupted(from, "truncated request offset footer");
                    return;
                };
                p.first_request_offset = Some(offset);
            }

            if flags.contains(PacketFlags::IS_FRAGMENT) {
                let last = p.strip_u32().and_then(SeqNum::from_wire);
                let first = p.strip_u32().and_then(SeqNum::from_wire);
                let (Some(first), Some(last)) = (first, last) else {
                    drop(p);
                    self.corrupted(from, "truncated fragment footer");
                    return;
                };
                let span_len = last.dist_after(first) + 1;
                let in_span = p
                    .seq
                    .map(|s| s.dist_after(first) < span_len)
                    .unwrap_or(false);
                if span_len > MAX_FRAGMENTS_PER_BUNDLE || !in_span {
                    drop(p);
                    self.corrupted(from, "implausible fragment span");
                    return;
                }
                p.fragment_span = Some((first, last));
            }
        }

        // older reliable traffic first, it carries lower sequence numbers
        for block in piggyback_blocks.into_iter().rev() {
            match Packet::from_datagram(&block) {
                Some(sub) => {
                    self.process_packet(from, Rc::new(std::cell::RefCell::new(sub)), false)
                }
                None => self.corrupted(from, "malformed piggyback block"),
            }
        }

        let channel = self.resolve_channel(from, flags, indexed);

        if !acks.is_empty() {
            match &channel {
                Some(channel) => {
                    for seq in acks {
                        let outcome = channel.borrow_mut().del_resend_timer(seq, Instant::now());
                        match outcome {
                            Ok(promoted) => self.transmit_promoted(channel, promoted),
                            Err(_) => {
                                self.corrupted(from, "ack outside the send window");
                            }
                        }
                    }
                }
                None => {
                    for seq in acks {
                        self.ack_once_off(from, seq);
                    }
                }
            }
        }

        self.route_packet(from, packet, channel);
    }

    fn resolve_channel(
        &mut self,
        from: SocketAddr,
        flags: PacketFlags,
        indexed: Option<(u32, ChannelId)>,
    ) -> Option<ChannelPtr> {
        if let Some((version, id)) = indexed {
            if let Some(channel) = self.indexed_channels.get(&id).cloned() {
                if !channel.borrow_mut().switch_addr(from, version) {
                    trace!(
                        "ignoring stale version {} for indexed channel {}",
                        version,
                        id
                    );
                }
                return Some(channel);
            }
            // condemned indexed channels keep receiving acks until they drain
            if let Some(channel) = self.condemned.find_indexed(id) {
                return Some(channel);
            }
            if let Some(channel) = self
                .channel_finder
                .as_ref()
                .and_then(|f| f.find_indexed(id, from))
            {
                channel.borrow_mut().switch_addr(from, version);
                return Some(channel);
            }
            if flags.contains(PacketFlags::CREATE_CHANNEL) {
                let channel = self.create_indexed_channel(id, from);
                channel.borrow_mut().switch_addr(from, version);
                return Some(channel);
            }
            self.err_reporter
                .report(Some(from), "packet for unknown indexed channel");
            return None;
        }

        if flags.contains(PacketFlags::ON_CHANNEL) {
            if let Some(channel) = self.channels.get(&from).cloned() {
                return Some(channel);
            }
            // condemned channels keep receiving acks until they drain
            if let Some(channel) = self.condemned.find(from) {
                return Some(channel);
            }
            if flags.contains(PacketFlags::CREATE_CHANNEL) {
                if self.config.is_external {
                    self.err_reporter
                        .report(Some(from), "refusing anonymous channel creation");
                    return None;
                }
                let channel = self.create_channel(from);
                channel.borrow_mut().set_anonymous(true);
                debug!("auto-created anonymous channel to {}", from);
                return Some(channel);
            }
            self.err_reporter
                .report(Some(from), "on-channel packet without a channel");
        }
        None
    }

    fn route_packet(&mut self, from: SocketAddr, packet: PacketPtr, channel: Option<ChannelPtr>) {
        let (seq, is_reliable) = {
            let p = packet.borrow();
            (p.seq, p.has_flags(PacketFlags::IS_RELIABLE))
        };

        match (channel, seq) {
            (Some(_), Some(_)) if !is_reliable => {
                // unreliable fragments carry hub-level sequence numbers, not
                // channel ones; they reassemble off-channel
                self.route_off_channel(from, packet);
            }
            (Some(channel), Some(seq)) => {
                channel.borrow_mut().queue_ack(seq);
                if !self
                    .ack_flush_queue
                    .iter()
                    .any(|c| Rc::ptr_eq(c, &channel))
                {
                    self.ack_flush_queue.push(channel.clone());
                }
                let decision = channel.borrow_mut().record_incoming(packet);
                match decision {
                    IncomingDecision::Deliver(packets) => {
                        for packet in packets {
                            self.deliver_on_channel(from, packet, &channel);
                        }
                    }
                    IncomingDecision::Buffered | IncomingDecision::Duplicate => {}
                    IncomingDecision::OutOfWindow => {
                        self.corrupted(from, "sequence number outside the receive window");
                    }
                }
            }
            (Some(_), None) => {
                // unsequenced traffic on a channel, e.g. an ack-only frame
                self.dispatch_packets(from, vec![packet]);
            }
            (None, Some(seq)) if is_reliable => {
                // once-off reliable
                if self.config.is_external {
                    trace!("external hub dropping once-off reliable packet from {}", from);
                    return;
                }
                self.send_once_off_ack(from, seq);
                if self.once_off_seen_before(from, seq) {
                    self.num_once_off_duplicates += 1;
                    return;
                }
                self.route_off_channel(from, packet);
            }
            (None, _) => self.route_off_channel(from, packet),
        }
    }

    fn deliver_on_channel(&mut self, from: SocketAddr, packet: PacketPtr, channel: &ChannelPtr) {
        let span = packet.borrow().fragment_span;
        match span {
            None => self.dispatch_packets(from, vec![packet]),
            Some(span) => {
                let mut ch = channel.borrow_mut();
                let fragments = ch
                    .fragments
                    .get_or_insert_with(|| FragmentedBundle::new(span));
                if fragments.span() != span {
                    drop(ch);
                    self.corrupted(from, "fragment for a different bundle than expected");
                    return;
                }
                match fragments.add(packet) {
                    FragmentAdd::Complete(chain) => {
                        ch.fragments = None;
                        drop(ch);
                        self.dispatch_packets(from, chain);
                    }
                    FragmentAdd::Pending => {}
                    FragmentAdd::Duplicate => {}
                }
            }
        }
    }

    fn route_off_channel(&mut self, from: SocketAddr, packet: PacketPtr) {
        let span = packet.borrow().fragment_span;
        match span {
            None => self.dispatch_packets(from, vec![packet]),
            Some(span) => {
                let key = (from, span.0);
                let in_seq = packet.borrow().seq;
                let Some(seq) = in_seq else {
                    self.corrupted(from, "fragment without a sequence number");
                    return;
                };
                let outcome = {
                    let fragments = self
                        .fragments
                        .entry(key)
                        .or_insert_with(|| FragmentedBundle::new(span));
                    if fragments.span() != span || !fragments.contains(seq) {
                        None
                    } else {
                        Some(fragments.add(packet))
                    }
                };
                match outcome {
                    None => self.corrupted(from, "fragment outside its bundle span"),
                    Some(FragmentAdd::Complete(chain)) => {
                        self.fragments.remove(&key);
                        self.dispatch_packets(from, chain);
                    }
                    Some(FragmentAdd::Pending) | Some(FragmentAdd::Duplicate) => {}
                }
            }
        }
    }

    fn send_once_off_ack(&mut self, addr: SocketAddr, seq: SeqNum) {
        let mut bundle = Bundle::new();
        bundle.add_ack(seq);
        if self.send_bundle(addr, &mut bundle, None).is_err() {
            warn!("failed to ack once-off packet from {}", addr);
        }
    }

    fn dispatch_packets(&mut self, from: SocketAddr, packets: Vec<PacketPtr>) {
        let mut messages = Vec::new();
        let mut walk_error = None;
        {
            let mut walker = MessageWalker::new(&self.interface, packets);
            while let Some(result) = walker.next_message() {
                match result {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        walk_error = Some(e);
                        break;
                    }
                }
            }
        }

        for message in messages {
            if message.message_id == REPLY_MESSAGE_IDENTIFIER {
                self.dispatch_reply(from, message.payload);
            } else if let Some(handler) = self.interface.handler(message.message_id) {
                let incoming = IncomingMessage {
                    source: from,
                    message_id: message.message_id,
                    reply_id: message.reply_id,
                    payload: message.payload,
                };
                handler.handle_message(self, incoming);
            } else {
                self.corrupted(from, "message with unserved id");
            }
        }

        if let Some(e) = walk_error {
            match e {
                WalkError::UnknownMessageId(id) => {
                    self.corrupted(from, &format!("unknown message id {}", id))
                }
                WalkError::TruncatedHeader => self.corrupted(from, "truncated message header"),
                WalkError::TruncatedPayload => self.corrupted(from, "truncated message payload"),
            }
        }
    }

    fn dispatch_reply(&mut self, from: SocketAddr, payload: bytes::Bytes) {
        if payload.len() < 4 {
            self.corrupted(from, "reply without a reply id");
            return;
        }
        let reply_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let Some(record) = self.reply_handlers.remove(&reply_id) else {
            trace!("reply {} from {} arrived after its request completed", reply_id, from);
            return;
        };
        if let Some(timer) = record.timer {
            self.timers.cancel(timer);
        }
        record
            .handler
            .handle_reply(self, from, payload.slice(4..));
    }

    fn corrupted(&mut self, from: SocketAddr, what: &str) {
        self.num_corrupted_packets_received += 1;
        self.err_reporter.report(Some(from), what);
    }

    // ---- counters ------------------------------------------------------

    pub fn num_packets_sent(&self) -> u32 {
        self.num_packets_sent
    }

    pub fn num_packets_received(&self) -> u32 {
        self.num_packets_received
    }

    pub fn num_corrupted_packets_received(&self) -> u32 {
        self.num_corrupted_packets_received
    }

    pub fn num_once_off_duplicates(&self) -> u32 {
        self.num_once_off_duplicates
    }

    pub fn num_pending_requests(&self) -> usize {
        self.reply_handlers.len()
    }

    pub fn num_condemned_channels(&self) -> usize {
        self.condemned.len()
    }
}
