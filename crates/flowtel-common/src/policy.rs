//! Monitoring policy model.
//!
//! [`PolicyConfig`] is the operator-facing object pushed to switches and
//! loaded from configuration files. [`SamplingPolicy`] is the compact view
//! consulted on every packet.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Telemetry features a switch can be asked to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    PacketCount,
    ByteCount,
    FlowDuration,
    ProtocolAnalysis,
}

impl Feature {
    /// All features, in wire order.
    pub const ALL: [Feature; 4] = [
        Feature::PacketCount,
        Feature::ByteCount,
        Feature::FlowDuration,
        Feature::ProtocolAnalysis,
    ];
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Feature::PacketCount => "packet_count",
            Feature::ByteCount => "byte_count",
            Feature::FlowDuration => "flow_duration",
            Feature::ProtocolAnalysis => "protocol_analysis",
        };
        write!(f, "{}", s)
    }
}

/// Alerting thresholds evaluated by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Average bytes per second over a flow's lifetime
    #[serde(default = "default_high_bandwidth")]
    pub high_bandwidth_bps: u64,

    /// Flow lifetime in seconds
    #[serde(default = "default_long_flow")]
    pub long_flow_secs: u64,

    /// Distinct destination ports contacted by one source
    #[serde(default = "default_port_scan")]
    pub port_scan_ports: usize,
}

/// Monitoring policy pushed to switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Export one digest every N packets of a flow
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate_default: u32,

    /// Collector flush interval in seconds
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Inactivity timeout after which a flow is expired
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout_secs: u64,

    /// Features included in exported digests
    #[serde(default = "default_features")]
    pub enabled_features: BTreeSet<Feature>,

    /// Sampling interval overrides keyed by IP protocol number
    #[serde(default, with = "protocol_map")]
    pub per_protocol_overrides: BTreeMap<u8, u32>,

    /// Alerting thresholds
    #[serde(default)]
    pub thresholds: AlertThresholds,
}

fn default_sampling_rate() -> u32 {
    1
}

fn default_export_interval() -> u64 {
    5
}

fn default_flow_timeout() -> u64 {
    300
}

fn default_features() -> BTreeSet<Feature> {
    Feature::ALL.into_iter().collect()
}

fn default_high_bandwidth() -> u64 {
    1_000_000
}

fn default_long_flow() -> u64 {
    3_600
}

fn default_port_scan() -> usize {
    100
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            high_bandwidth_bps: default_high_bandwidth(),
            long_flow_secs: default_long_flow(),
            port_scan_ports: default_port_scan(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            sampling_rate_default: default_sampling_rate(),
            export_interval_secs: default_export_interval(),
            flow_timeout_secs: default_flow_timeout(),
            enabled_features: default_features(),
            per_protocol_overrides: BTreeMap::new(),
            thresholds: AlertThresholds::default(),
        }
    }
}

impl PolicyConfig {
    /// Validates the policy as a whole.
    ///
    /// Either the whole object is accepted or the first violation is
    /// returned; callers keep their previous policy on error.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.sampling_rate_default == 0 {
            return Err(PolicyError::ZeroSamplingInterval {
                scope: "default".to_string(),
            });
        }

        for (protocol, interval) in &self.per_protocol_overrides {
            if *interval == 0 {
                return Err(PolicyError::ZeroSamplingInterval {
                    scope: format!("protocol {}", protocol),
                });
            }
        }

        if self.export_interval_secs == 0 {
            return Err(PolicyError::invalid_field(
                "export_interval_secs",
                "must be at least 1 second",
            ));
        }

        if self.flow_timeout_secs == 0 {
            return Err(PolicyError::invalid_field(
                "flow_timeout_secs",
                "must be at least 1 second",
            ));
        }

        if !self.enabled_features.contains(&Feature::PacketCount) {
            return Err(PolicyError::invalid_field(
                "enabled_features",
                "packet_count cannot be disabled",
            ));
        }

        if self.thresholds.port_scan_ports == 0 {
            return Err(PolicyError::invalid_field(
                "thresholds.port_scan_ports",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Returns true if the feature is enabled.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.enabled_features.contains(&feature)
    }

    /// Get flow timeout as Duration
    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }

    /// Get export interval as Duration
    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }
}

/// Per-packet sampling view of a [`PolicyConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingPolicy {
    default_interval: u32,
    overrides: BTreeMap<u8, u32>,
    features: BTreeSet<Feature>,
}

impl SamplingPolicy {
    /// Builds a sampling policy from a validated configuration.
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: &PolicyConfig) -> Self {
        Self {
            default_interval: config.sampling_rate_default,
            overrides: config.per_protocol_overrides.clone(),
            features: config.enabled_features.clone(),
        }
    }

    /// Sampling interval applying to the given protocol.
    pub fn interval_for(&self, protocol: u8) -> u32 {
        self.overrides
            .get(&protocol)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Default sampling interval.
    pub fn default_interval(&self) -> u32 {
        self.default_interval
    }

    /// Returns true if the feature is enabled.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::from_validated(&PolicyConfig::default())
    }
}

/// Serializes protocol-keyed maps with string keys so that TOML tables
/// such as `[policy.per_protocol_overrides]` with `6 = 10` round-trip.
mod protocol_map {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<u8, u32>, s: S) -> Result<S::Ok, S::Error> {
        let stringly: BTreeMap<String, u32> =
            map.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        stringly.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u8, u32>, D::Error> {
        let stringly = BTreeMap::<String, u32>::deserialize(d)?;
        stringly
            .into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<u8>()
                    .map(|p| (p, v))
                    .map_err(|_| D::Error::custom(format!("invalid protocol number '{}'", k)))
            })
            .collect()
    }
}
