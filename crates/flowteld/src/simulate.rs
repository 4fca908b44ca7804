//! Simulated switches.
//!
//! Each simulated switch runs a real [`FlowPipeline`] over synthetic
//! traffic, registers with the rule manager through a
//! [`LocalSwitchChannel`] and exports digests over an in-process channel
//! attached to the collector.

use crate::config_file::FlowtelConfig;
use crate::error::Result;
use flowtel_collector::DigestConsumer;
use flowtel_common::{now_micros, FlowKey, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use flowtel_dataplane::{ChannelSink, FlowPipeline};
use flowtel_rulemgr::{FlowRuleManager, LocalChannelFactory, LocalSwitchChannel, RegistrationRequest};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// First control port handed to simulated switches.
const SIM_CONTROL_PORT_BASE: u16 = 19_000;

const HOST_PAIRS: [([u8; 4], [u8; 4]); 5] = [
    ([192, 168, 1, 100], [10, 0, 0, 50]),
    ([192, 168, 1, 200], [10, 0, 0, 100]),
    ([10, 0, 0, 1], [192, 168, 1, 150]),
    ([192, 168, 1, 10], [8, 8, 8, 8]),
    ([192, 168, 1, 11], [8, 8, 4, 4]),
];

// web, https, dns, ssh, mysql
const PORT_PAIRS: [(u16, u16); 5] = [(12345, 80), (54321, 443), (53, 53), (22, 22), (3306, 3306)];

const PROTOCOLS: [u8; 3] = [IPPROTO_TCP, IPPROTO_UDP, IPPROTO_ICMP];

/// One synthetic flow with a fixed packet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedFlow {
    pub key: FlowKey,
    pub packet_size: u32,
}

/// Random traffic over a fixed flow catalogue.
pub struct TrafficGenerator {
    flows: Vec<SimulatedFlow>,
    rng: StdRng,
    max_burst: u32,
}

impl TrafficGenerator {
    pub fn new(seed: u64, max_burst: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let flows = Self::catalogue(&mut rng);
        Self {
            flows,
            rng,
            max_burst: max_burst.max(1),
        }
    }

    /// Every host pair crossed with every port pair and protocol. ICMP
    /// flows carry no ports, so they collapse to one flow per host pair.
    fn catalogue(rng: &mut StdRng) -> Vec<SimulatedFlow> {
        let mut seen = HashSet::new();
        let mut flows = Vec::new();
        for (src, dst) in HOST_PAIRS {
            for (src_port, dst_port) in PORT_PAIRS {
                for protocol in PROTOCOLS {
                    let (src_port, dst_port) = if protocol == IPPROTO_ICMP {
                        (0, 0)
                    } else {
                        (src_port, dst_port)
                    };
                    let key = FlowKey::new(
                        Ipv4Addr::from(src),
                        Ipv4Addr::from(dst),
                        protocol,
                        src_port,
                        dst_port,
                    );
                    if seen.insert(key) {
                        flows.push(SimulatedFlow {
                            key,
                            packet_size: rng.gen_range(64..=1500),
                        });
                    }
                }
            }
        }
        flows
    }

    pub fn flows(&self) -> &[SimulatedFlow] {
        &self.flows
    }

    /// Picks a flow and a burst length.
    pub fn next_burst(&mut self) -> Option<(SimulatedFlow, u32)> {
        let flow = *self.flows.choose(&mut self.rng)?;
        let packets = self.rng.gen_range(1..=self.max_burst);
        Some((flow, packets))
    }
}

/// Handle on a running simulated switch.
pub struct SimulatedSwitch {
    pub switch_id: String,
    pub channel: Arc<LocalSwitchChannel>,
}

/// Creates `count` simulated switches, registers them and starts their
/// traffic loops on `tasks`.
pub async fn spawn_switches(
    count: usize,
    config: &FlowtelConfig,
    factory: &LocalChannelFactory,
    manager: &Arc<FlowRuleManager>,
    consumer: &Arc<DigestConsumer>,
    tasks: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<Vec<SimulatedSwitch>> {
    let mut switches = Vec::with_capacity(count);
    let tick = Duration::from_millis(config.dataplane.sim_tick_ms);

    for index in 0..count {
        let switch_id = format!("sim-switch-{}", index + 1);
        let (sink, rx) = ChannelSink::channel(config.collector.ingest_channel_capacity);
        let pipeline = Arc::new(FlowPipeline::new(config.pipeline_config(), Arc::new(sink))?);
        let channel = Arc::new(LocalSwitchChannel::new(Arc::clone(&pipeline)));
        factory.add_switch(switch_id.clone(), Arc::clone(&channel));

        let port = SIM_CONTROL_PORT_BASE.saturating_add(index as u16);
        let response = manager
            .register(RegistrationRequest {
                switch_id: switch_id.clone(),
                control_address: format!("127.0.0.1:{}", port),
                device_id: format!("sim-device-{}", index),
            })
            .await?;
        pipeline.apply_policy(&response.accepted_policy)?;
        consumer.attach(switch_id.clone(), rx);

        let mut generator = TrafficGenerator::new(rand::random(), config.dataplane.sim_max_burst);
        let cancel = cancel.child_token();
        let id = switch_id.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some((flow, packets)) = generator.next_burst() {
                            for _ in 0..packets {
                                pipeline.process_key(&flow.key, flow.packet_size, now_micros());
                            }
                        }
                    }
                }
            }
            debug!(switch_id = %id, "Simulated traffic stopped");
        });

        switches.push(SimulatedSwitch { switch_id, channel });
    }

    info!(switches = count, "Simulated switches started");
    Ok(switches)
}
