use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::packet::PacketPtr;
use crate::seq::SeqNum;

pub enum FragmentAdd {
    /// All fragments arrived; the returned chain is ordered by sequence.
    Complete(Vec<PacketPtr>),
    Pending,
    Duplicate,
}

/// A multi-packet bundle being reassembled. Fragments may arrive in any
///  order off-channel; they are kept sorted by sequence number and the
///  bundle completes when the whole span is present.
pub struct FragmentedBundle {
    first: SeqNum,
    last: SeqNum,
    packets: Vec<PacketPtr>,
    last_touched: Instant,
}

impl FragmentedBundle {
    pub const MAX_AGE: Duration = Duration::from_secs(10);

    pub fn new(span: (SeqNum, SeqNum)) -> FragmentedBundle {
        FragmentedBundle {
            first: span.0,
            last: span.1,
            packets: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    pub fn span(&self) -> (SeqNum, SeqNum) {
        (self.first, self.last)
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        seq.dist_after(self.first) <= self.last.dist_after(self.first)
    }

    /// Files one fragment. The caller has already checked that the packet's
    ///  sequence number lies within this bundle's span.
    pub fn add(&mut self, packet: PacketPtr) -> FragmentAdd {
        let seq = packet
            .borrow()
            .seq
            .expect("fragments always carry a sequence number");
        debug_assert!(self.contains(seq));
        self.last_touched = Instant::now();

        let pos = self
            .packets
            .partition_point(|p| {
                p.borrow().seq.unwrap().dist_after(self.first) < seq.dist_after(self.first)
            });
        if let Some(existing) = self.packets.get(pos) {
            if existing.borrow().seq == Some(seq) {
                return FragmentAdd::Duplicate;
            }
        }
        self.packets.insert(pos, packet);

        let expected = self.last.dist_after(self.first) as usize + 1;
        if self.packets.len() == expected {
            trace!("fragmented bundle {}..{} complete", self.first, self.last);
            FragmentAdd::Complete(std::mem::take(&mut self.packets))
        } else {
            FragmentAdd::Pending
        }
    }

    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.duration_since(self.last_touched) > max_age
    }

    pub fn packets(&self) -> &[PacketPtr] {
        &self.packets
    }

    pub fn take_packets(&mut self) -> Vec<PacketPtr> {
        std::mem::take(&mut self.packets)
    }

    pub fn restore_packet(&mut self, packet: PacketPtr) {
        self.last_touched = Instant::now();
        self.packets.push(packet);
    }
}
