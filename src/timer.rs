use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::interface::{ReplyId, TimerExpiryHandler};
use crate::seq::SeqNum;

pub type TimerId = u64;

/// What to do when a timer fires. The hub owns the queue and interprets
///  these itself; `User` timers call back into the application.
#[derive(Clone)]
pub enum TimerAction {
    ReplyTimeout(ReplyId),
    OnceOffResend(SocketAddr, SeqNum),
    ArtificialDelay(u64),
    IrregularResendCheck,
    CondemnedCheck,
    FragmentReaper,
    ErrReportFlush,
    OnceOffReceiptAgeOut,
    ChildNubPoll,
    User(Rc<dyn TimerExpiryHandler>),
}

struct TimerEntry {
    action: TimerAction,
    interval: Option<Duration>,
}

/// A software timer queue: a min-heap of deadlines over a map of live
///  entries. Cancellation just drops the map entry; the heap slot is
///  reaped when it surfaces. With the hub being single-threaded there is
///  no separate timer thread, the event loop sleeps until
///  [TimerQueue::next_deadline].
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: FxHashMap<TimerId, TimerEntry>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            entries: FxHashMap::default(),
            next_id: 1,
        }
    }

    pub fn add_once(&mut self, delay: Duration, action: TimerAction) -> TimerId {
        self.add(delay, None, action)
    }

    pub fn add_repeating(&mut self, interval: Duration, action: TimerAction) -> TimerId {
        self.add(interval, Some(interval), action)
    }

    fn add(&mut self, delay: Duration, interval: Option<Duration>, action: TimerAction) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, TimerEntry { action, interval });
        self.heap.push(Reverse((Instant::now() + delay, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn is_live(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The deadline the event loop should sleep until, skipping entries
    ///  that were cancelled since they were queued.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops one timer that is due at `now`, rescheduling it first if it
    ///  repeats. Call in a loop until it returns `None`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerAction)> {
        loop {
            let Reverse((deadline, id)) = self.heap.peek().copied()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get(&id) else {
                continue; // cancelled
            };
            let action = entry.action.clone();
            match entry.interval {
                Some(interval) => {
                    self.heap.push(Reverse((deadline + interval, id)));
                }
                None => {
                    self.entries.remove(&id);
                }
            }
            return Some((id, action));
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        TimerQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired_ids(queue: &mut TimerQueue, now: Instant) -> Vec<TimerId> {
        let mut ids = Vec::new();
        while let Some((id, _)) = queue.pop_expired(now) {
            ids.push(id);
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let late = queue.add_once(Duration::from_secs(2), TimerAction::FragmentReaper);
        let early = queue.add_once(Duration::from_secs(1), TimerAction::FragmentReaper);

        let now = Instant::now();
        assert_eq!(expired_ids(&mut queue, now), Vec::<TimerId>::new());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));

        assert_eq!(
            expired_ids(&mut queue, now + Duration::from_secs(3)),
            vec![early, late]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut queue = TimerQueue::new();
        let a = queue.add_once(Duration::from_secs(1), TimerAction::CondemnedCheck);
        let b = queue.add_once(Duration::from_secs(1), TimerAction::CondemnedCheck);
        assert!(queue.cancel(a));
        assert!(!queue.cancel(a));

        assert_eq!(
            expired_ids(&mut queue, Instant::now() + Duration::from_secs(2)),
            vec![b]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_does_not_block_deadline() {
        let mut queue = TimerQueue::new();
        let a = queue.add_once(Duration::from_secs(1), TimerAction::CondemnedCheck);
        queue.add_once(Duration::from_secs(5), TimerAction::CondemnedCheck);
        queue.cancel(a);

        let now = Instant::now();
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_reschedules() {
        let mut queue = TimerQueue::new();
        let id = queue.add_repeating(Duration::from_secs(1), TimerAction::ErrReportFlush);

        let now = Instant::now();
        assert_eq!(expired_ids(&mut queue, now + Duration::from_secs(1)), vec![id]);
        assert!(queue.is_live(id));
        assert_eq!(expired_ids(&mut queue, now + Duration::from_secs(2)), vec![id]);

        queue.cancel(id);
        assert_eq!(
            expired_ids(&mut queue, now + Duration::from_secs(10)),
            Vec::<TimerId>::new()
        );
        assert_eq!(queue.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_catches_up_tick_by_tick() {
        let mut queue = TimerQueue::new();
        let id = queue.add_repeating(Duration::from_secs(1), TimerAction::ErrReportFlush);

        // three missed intervals fire as three separate expiries
        let now = Instant::now() + Duration::from_secs(3);
        assert_eq!(expired_ids(&mut queue, now), vec![id, id, id]);
    }
}
