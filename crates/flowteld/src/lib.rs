//! Flow-telemetry daemon.
//!
//! Hosts the digest collector and the flow rule manager in one process:
//!
//! - UDP digest listener (`token || digest` datagrams from switches)
//! - HTTP API for registration, heartbeats, policy, statistics and metrics
//! - optional in-process simulated switches

mod error;
pub mod api;
pub mod config_file;
pub mod daemon;
pub mod listener;
pub mod simulate;

pub use api::{build_router, AppState};
pub use config_file::{FlowtelConfig, DEFAULT_CONFIG_PATH};
pub use daemon::Daemon;
pub use error::{DaemonError, Result};
pub use listener::{split_datagram, DigestListener, DATAGRAM_LEN};
pub use simulate::{SimulatedFlow, SimulatedSwitch, TrafficGenerator};
