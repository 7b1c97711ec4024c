use std::ops::Range;
use std::time::Duration;

use anyhow::bail;

use crate::reconnect::ReconnectionPolicy;

/// All tunables of the connection substrate. Explicitly constructed and passed in rather
///  than living in process-wide mutable state, so several independent connections with
///  different configurations can coexist in one process.
#[derive(Clone, Debug)]
pub struct SubstrateConfig {
    /// Upper bound for blocking on the reply to a single request, both for negotiation
    ///  gates and for collector waits that do not pass an explicit timeout.
    pub reply_timeout: Duration,

    /// How many matching stanzas a collector retains before it starts dropping the oldest.
    pub collector_capacity: usize,

    /// Number of reactor worker threads. Must be at least 2: one thread has to stay
    ///  available for scheduled actions while another blocks in the readiness poll.
    pub reactor_worker_count: usize,

    pub reconnect_policy: ReconnectionPolicy,

    /// Range (in seconds) from which each reconnection controller draws its per-instance
    ///  jitter base, spreading reconnect storms of many clients across time.
    pub reconnect_random_base_range: Range<u32>,
}

impl SubstrateConfig {
    pub fn new() -> SubstrateConfig {
        SubstrateConfig {
            reply_timeout: Duration::from_secs(5),
            collector_capacity: 5000,
            reactor_worker_count: 2,
            reconnect_policy: ReconnectionPolicy::RandomIncreasingDelay,
            reconnect_random_base_range: 2..15,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reactor_worker_count < 2 {
            bail!(
                "the reactor needs at least two worker threads, configured: {}",
                self.reactor_worker_count
            );
        }
        if self.collector_capacity == 0 {
            bail!("collector capacity must be at least 1");
        }
        if self.reply_timeout.is_zero() {
            bail!("reply timeout must be positive");
        }
        if self.reconnect_random_base_range.is_empty() {
            bail!("reconnect random base range must be non-empty");
        }
        Ok(())
    }
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        SubstrateConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::defaults_valid(2, 5000, true)]
    #[case::bigger_pool(8, 5000, true)]
    #[case::single_worker(1, 5000, false)]
    #[case::zero_workers(0, 5000, false)]
    #[case::zero_capacity(2, 0, false)]
    fn test_validate(
        #[case] reactor_worker_count: usize,
        #[case] collector_capacity: usize,
        #[case] expected_ok: bool,
    ) {
        let config = SubstrateConfig {
            reactor_worker_count,
            collector_capacity,
            ..SubstrateConfig::new()
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_validate_empty_jitter_range() {
        let config = SubstrateConfig {
            reconnect_random_base_range: 5..5,
            ..SubstrateConfig::new()
        };
        assert!(config.validate().is_err());
    }
}
