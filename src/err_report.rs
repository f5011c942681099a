use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{error, warn};

struct ReportState {
    suppressed: u32,
    last_logged: Instant,
    last_raised: Instant,
}

/// Coalesces repeated error reports about the same (peer, message) pair so
///  a flapping peer cannot flood the log. The first occurrence is logged
///  immediately; repeats are counted and summarized on the flush timer.
pub struct ErrorReporter {
    min_log_interval: Duration,
    idle_age: Duration,
    reports: FxHashMap<(Option<SocketAddr>, String), ReportState>,
}

impl ErrorReporter {
    pub fn new(min_log_interval: Duration, idle_age: Duration) -> ErrorReporter {
        ErrorReporter {
            min_log_interval,
            idle_age,
            reports: FxHashMap::default(),
        }
    }

    /// Reports an error, logging it unless an identical report was logged
    ///  within the minimum interval. Returns whether it was logged now.
    pub fn report(&mut self, address: Option<SocketAddr>, message: &str) -> bool {
        let now = Instant::now();
        let key = (address, message.to_owned());

        match self.reports.get_mut(&key) {
            Some(state) => {
                state.last_raised = now;
                if now.duration_since(state.last_logged) >= self.min_log_interval {
                    Self::log(address, message, state.suppressed + 1);
                    state.suppressed = 0;
                    state.last_logged = now;
                    true
                } else {
                    state.suppressed += 1;
                    false
                }
            }
            None => {
                Self::log(address, message, 1);
                self.reports.insert(
                    key,
                    ReportState {
                        suppressed: 0,
                        last_logged: now,
                        last_raised: now,
                    },
                );
                true
            }
        }
    }

    /// Driven by a repeating hub timer: logs pending summaries whose
    ///  interval has elapsed and forgets entries that went quiet. Returns
    ///  the number of summaries logged.
    pub fn flush(&mut self) -> usize {
        let now = Instant::now();
        let mut logged = 0;

        self.reports.retain(|(address, message), state| {
            if state.suppressed > 0
                && now.duration_since(state.last_logged) >= self.min_log_interval
            {
                Self::log(*address, message, state.suppressed);
                state.suppressed = 0;
                state.last_logged = now;
                logged += 1;
            }
            now.duration_since(state.last_raised) < self.idle_age
        });
        logged
    }

    fn log(address: Option<SocketAddr>, message: &str, occurrences: u32) {
        match (address, occurrences) {
            (Some(addr), 1) => error!("{} (peer {})", message, addr),
            (Some(addr), n) => warn!("{} occurrences: {} (peer {})", n, message, addr),
            (None, 1) => error!("{}", message),
            (None, n) => warn!("{} occurrences: {}", n, message),
        }
    }

    #[cfg(test)]
    fn num_tracked(&self) -> usize {
        self.reports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> ErrorReporter {
        ErrorReporter::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_report_logs_immediately() {
        let mut r = reporter();
        assert!(r.report(None, "socket error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeats_within_interval_are_suppressed() {
        let mut r = reporter();
        assert!(r.report(None, "socket error"));
        assert!(!r.report(None, "socket error"));
        assert!(!r.report(None, "socket error"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(r.report(None, "socket error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_suppress_each_other() {
        let addr_a: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:7000".parse().unwrap();

        let mut r = reporter();
        assert!(r.report(Some(addr_a), "corrupted packet"));
        assert!(r.report(Some(addr_b), "corrupted packet"));
        assert!(r.report(Some(addr_a), "window overflow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_summarizes_suppressed_reports() {
        let mut r = reporter();
        r.report(None, "socket error");
        r.report(None, "socket error");
        r.report(None, "socket error");

        assert_eq!(r.flush(), 0); // interval not yet elapsed
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(r.flush(), 1);
        assert_eq!(r.flush(), 0); // nothing pending anymore
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_age_out() {
        let mut r = reporter();
        r.report(None, "socket error");
        assert_eq!(r.num_tracked(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        r.flush();
        assert_eq!(r.num_tracked(), 0);

        // after aging out, the next report logs immediately again
        assert!(r.report(None, "socket error"));
    }
}
