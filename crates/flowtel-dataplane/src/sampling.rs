//! Sampling decisions.
//!
//! A flow with interval `N` exports on its 1st, (N+1)th, (2N+1)th packet
//! and so on. With `N == 1` every packet exports.

use flowtel_common::{PolicyConfig, SamplingPolicy};
use parking_lot::RwLock;
use std::sync::Arc;

/// Returns true if the post-update packet count triggers an export.
#[inline]
pub fn should_export(packet_count: u32, interval: u32) -> bool {
    debug_assert!(interval > 0, "sampling interval validated at policy boundary");
    if interval <= 1 {
        return true;
    }
    packet_count % interval == 1
}

/// Shared, atomically replaceable sampling policy.
///
/// Readers take a cheap `Arc` clone; writers swap the whole policy, so a
/// packet never observes a half-applied update.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<SamplingPolicy>>>,
}

impl PolicyHandle {
    /// Creates a handle holding `policy`.
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// Returns the policy in force.
    pub fn current(&self) -> Arc<SamplingPolicy> {
        Arc::clone(&self.inner.read())
    }

    /// Validates `config` and installs it. On error the previous policy
    /// stays in force.
    pub fn apply(&self, config: &PolicyConfig) -> Result<(), flowtel_common::PolicyError> {
        let policy = SamplingPolicy::new(config)?;
        *self.inner.write() = Arc::new(policy);
        Ok(())
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(SamplingPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtel_common::{IPPROTO_TCP, IPPROTO_UDP};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interval_ten_exports_one_eleven_twentyone() {
        let exported: Vec<u32> = (1..=25).filter(|c| should_export(*c, 10)).collect();
        assert_eq!(exported, vec![1, 11, 21]);
    }

    #[test]
    fn test_interval_one_exports_every_packet() {
        assert!((1..=100).all(|c| should_export(c, 1)));
    }

    #[test]
    fn test_interval_two() {
        let exported: Vec<u32> = (1..=6).filter(|c| should_export(*c, 2)).collect();
        assert_eq!(exported, vec![1, 3, 5]);
    }

    #[test]
    fn test_saturated_counter_keeps_deciding() {
        // u32::MAX % 10 == 5, so a saturated flow stops exporting at N=10
        // but still exports at N=1.
        assert!(!should_export(u32::MAX, 10));
        assert!(should_export(u32::MAX, 1));
    }

    #[test]
    fn test_policy_handle_override() {
        let mut config = PolicyConfig {
            sampling_rate_default: 10,
            ..Default::default()
        };
        config.per_protocol_overrides.insert(IPPROTO_UDP, 1);
        let handle = PolicyHandle::default();
        handle.apply(&config).unwrap();

        let policy = handle.current();
        assert!(should_export(4, policy.interval_for(IPPROTO_UDP)));
        assert!(!should_export(4, policy.interval_for(IPPROTO_TCP)));
        assert!(should_export(11, policy.interval_for(IPPROTO_TCP)));
    }

    #[test]
    fn test_policy_handle_keeps_previous_on_error() {
        let handle = PolicyHandle::default();
        let good = PolicyConfig {
            sampling_rate_default: 5,
            ..Default::default()
        };
        handle.apply(&good).unwrap();

        let bad = PolicyConfig {
            sampling_rate_default: 0,
            ..Default::default()
        };
        assert!(handle.apply(&bad).is_err());
        assert_eq!(handle.current().default_interval(), 5);
    }
}
