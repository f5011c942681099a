use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{ChannelId, ChannelPtr};
use crate::seq::SeqNum;

/// Channels whose owner is gone but which still hold unacked reliable data.
///  They stay alive until drained, or until a hard age limit cuts them off.
#[derive(Default)]
pub struct CondemnedChannels {
    channels: Vec<ChannelPtr>,
}

impl CondemnedChannels {
    pub fn new() -> CondemnedChannels {
        CondemnedChannels::default()
    }

    pub fn add(&mut self, channel: ChannelPtr) {
        channel.borrow_mut().condemn();
        debug!(
            "channel to {} condemned with {} unacked packets",
            channel.borrow().peer_addr(),
            channel.borrow().num_unacked()
        );
        self.channels.push(channel);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Condemned channels still process acks so they can drain; the hub
    ///  resolves incoming traffic to them through this.
    pub fn find(&self, addr: std::net::SocketAddr) -> Option<ChannelPtr> {
        self.channels
            .iter()
            .find(|c| c.borrow().peer_addr() == addr)
            .cloned()
    }

    pub fn find_indexed(&self, id: ChannelId) -> Option<ChannelPtr> {
        self.channels
            .iter()
            .find(|c| c.borrow().id() == Some(id))
            .cloned()
    }

    /// Removes and returns the channels that are done: drained cleanly, or
    ///  condemned for longer than `max_age` (those still hold data the peer
    ///  will never ack).
    pub fn reap(&mut self, now: Instant, max_age: Duration) -> Vec<ChannelPtr> {
        let mut done = Vec::new();
        self.channels.retain(|channel| {
            let ch = channel.borrow();
            if ch.is_drained() {
                debug!("condemned channel to {} drained, destroying", ch.peer_addr());
                drop(ch);
                done.push(channel.clone());
                return false;
            }
            let too_old = ch
                .condemned_since()
                .map(|since| now.duration_since(since) > max_age)
                .unwrap_or(false);
            if too_old {
                warn!(
                    "condemned channel to {} still has {} unacked packets after {:?}, destroying anyway",
                    ch.peer_addr(),
                    ch.num_unacked(),
                    max_age
                );
                drop(ch);
                done.push(channel.clone());
                return false;
            }
            true
        });
        done
    }

    /// Resend candidates for the remaining condemned channels so their last
    ///  data still gets through.
    pub fn collect_resends(&self, now: Instant) -> Vec<(ChannelPtr, Vec<SeqNum>)> {
        let mut work = Vec::new();
        for channel in &self.channels {
            let due = channel.borrow_mut().check_resend_timers(now);
            if !due.is_empty() {
                work.push((channel.clone(), due));
            }
        }
        work
    }
}

/// Channels without a regular send schedule. Regular channels detect losses
///  when their next scheduled bundle goes out; these need a periodic sweep
///  instead.
#[derive(Default)]
pub struct IrregularChannels {
    channels: Vec<ChannelPtr>,
}

impl IrregularChannels {
    pub fn new() -> IrregularChannels {
        IrregularChannels::default()
    }

    pub fn add(&mut self, channel: ChannelPtr) {
        if self
            .channels
            .iter()
            .any(|c| std::rc::Rc::ptr_eq(c, &channel))
        {
            return;
        }
        channel.borrow_mut().set_irregular(true);
        self.channels.push(channel);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// One sweep of the periodic timer: drops channels that stopped being
    ///  irregular or got condemned (the condemned collection owns those),
    ///  and returns the resend candidates of the rest.
    pub fn tick(&mut self, now: Instant) -> Vec<(ChannelPtr, Vec<SeqNum>)> {
        let mut work = Vec::new();
        self.channels.retain(|channel| {
            {
                let ch = channel.borrow();
                if !ch.is_irregular() || ch.is_condemned() {
                    return false;
                }
            }
            let due = channel.borrow_mut().check_resend_timers(now);
            if !due.is_empty() {
                work.push((channel.clone(), due));
            }
            true
        });
        work
    }
}
