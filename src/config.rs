use std::rc::Rc;
use std::time::Duration;

use anyhow::bail;

/// Reliability category of a channel. The category determines the send
///  window dimensions: traffic between trusted server processes gets a much
///  deeper window than traffic to untrusted external peers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ChannelCategory {
    External,
    Internal,
    Indexed,
}

/// Called when a channel's unacked send window grows past its warn
///  threshold. Receives the channel's peer address and the current number
///  of unacked packets (window plus overflow).
pub type SendWindowCallback = Rc<dyn Fn(std::net::SocketAddr, usize)>;

pub struct NubConfig {
    /// Whether this hub faces untrusted peers. External hubs refuse
    ///  once-off reliable traffic and anonymous channel creation since both
    ///  let an unauthenticated sender tie up server-side state.
    pub is_external: bool,

    pub channel: ChannelTuning,

    /// Once every this many sent packets, one is dropped before it reaches
    ///  the socket. Zero disables loss injection.
    pub artificial_drop_per_n: u32,
    /// Sent packets are held back for a random delay in `[min, min+spread)`
    ///  before transmission.
    pub artificial_latency: Option<(Duration, Duration)>,
    /// Seed for the loss/latency RNG so tests can be replayed.
    pub artificial_seed: u64,

    pub once_off_resend_period: Duration,
    pub once_off_max_resends: u32,
    /// Receipts for once-off reliable packets are kept for dedup in two
    ///  generations; a full generation is discarded on this period.
    pub once_off_receipt_lifetime: Duration,

    pub irregular_check_period: Duration,
    pub condemned_check_period: Duration,
    /// A condemned channel still holding unacked data is destroyed anyway
    ///  once it has been condemned for this long.
    pub condemned_max_age: Duration,

    pub fragment_max_age: Duration,

    pub err_report_flush_period: Duration,
    pub err_report_idle_age: Duration,

    pub send_window_callback: Option<SendWindowCallback>,
}

impl NubConfig {
    pub fn default_internal() -> NubConfig {
        NubConfig {
            is_external: false,
            channel: ChannelTuning::default(),
            artificial_drop_per_n: 0,
            artificial_latency: None,
            artificial_seed: 0,
            once_off_resend_period: Duration::from_millis(500),
            once_off_max_resends: 50,
            once_off_receipt_lifetime: Duration::from_secs(30),
            irregular_check_period: Duration::from_millis(100),
            condemned_check_period: Duration::from_secs(1),
            condemned_max_age: Duration::from_secs(60),
            fragment_max_age: Duration::from_secs(10),
            err_report_flush_period: Duration::from_secs(1),
            err_report_idle_age: Duration::from_secs(10),
            send_window_callback: None,
        }
    }

    pub fn default_external() -> NubConfig {
        NubConfig {
            is_external: true,
            ..Self::default_internal()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.channel.validate()?;

        if self.once_off_max_resends == 0 {
            bail!("once-off reliable sends need at least one resend attempt");
        }
        if self.once_off_resend_period.is_zero() {
            bail!("once-off resend period must be positive");
        }
        if let Some((_, spread)) = self.artificial_latency {
            if spread.is_zero() {
                bail!("artificial latency spread must be positive");
            }
        }
        Ok(())
    }

    pub fn effective_channel_config(&self, category: ChannelCategory) -> EffectiveChannelConfig {
        let (window_size, max_overflow_packets) = match category {
            ChannelCategory::External => (
                self.channel.external_window_size,
                self.channel.external_max_overflow_packets,
            ),
            ChannelCategory::Internal => (
                self.channel.internal_window_size,
                self.channel.internal_max_overflow_packets,
            ),
            ChannelCategory::Indexed => (
                self.channel.indexed_window_size,
                self.channel.indexed_max_overflow_packets,
            ),
        };

        EffectiveChannelConfig {
            category,
            window_size,
            max_overflow_packets,
            send_window_warn_threshold: window_size / 2,
            min_inactivity_resend_delay: self.channel.min_inactivity_resend_delay,
        }
    }
}

/// Per-category window tuning. Window sizes must be powers of two since the
///  windows are indexed by masked sequence number.
pub struct ChannelTuning {
    pub external_window_size: u32,
    pub internal_window_size: u32,
    pub indexed_window_size: u32,

    /// Packets queued beyond the window before the channel overflows hard.
    ///  Zero means unlimited.
    pub external_max_overflow_packets: u32,
    pub internal_max_overflow_packets: u32,
    pub indexed_max_overflow_packets: u32,

    /// Lower bound for the inactivity resend threshold, which is otherwise
    ///  twice the measured round-trip time.
    pub min_inactivity_resend_delay: Duration,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        ChannelTuning {
            external_window_size: 256,
            internal_window_size: 4096,
            indexed_window_size: 512,
            external_max_overflow_packets: 1024,
            internal_max_overflow_packets: 8192,
            indexed_max_overflow_packets: 2048,
            min_inactivity_resend_delay: Duration::from_secs(1),
        }
    }
}

impl ChannelTuning {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, size) in [
            ("external", self.external_window_size),
            ("internal", self.internal_window_size),
            ("indexed", self.indexed_window_size),
        ] {
            if size < 2 || !size.is_power_of_two() {
                bail!("{} window size must be a power of two >= 2", name);
            }
            if size > crate::seq::SeqNum::SEQ_SIZE / 4 {
                bail!("{} window size too large for the sequence space", name);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct EffectiveChannelConfig {
    pub category: ChannelCategory,
    pub window_size: u32,
    pub max_overflow_packets: u32,
    pub send_window_warn_threshold: u32,
    pub min_inactivity_resend_delay: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NubConfig::default_internal().validate().is_ok());
        assert!(NubConfig::default_external().validate().is_ok());
    }

    #[test]
    fn test_window_size_validation() {
        let mut config = NubConfig::default_internal();
        config.channel.external_window_size = 100;
        assert!(config.validate().is_err());

        config.channel.external_window_size = 1;
        assert!(config.validate().is_err());

        config.channel.external_window_size = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_config_per_category() {
        let config = NubConfig::default_internal();
        assert_eq!(
            config
                .effective_channel_config(ChannelCategory::External)
                .window_size,
            256
        );
        assert_eq!(
            config
                .effective_channel_config(ChannelCategory::Internal)
                .window_size,
            4096
        );
        assert_eq!(
            config
                .effective_channel_config(ChannelCategory::Indexed)
                .window_size,
            512
        );
    }

    #[test]
    fn test_once_off_validation() {
        let mut config = NubConfig::default_internal();
        config.once_off_max_resends = 0;
        assert!(config.validate().is_err());
    }
}
