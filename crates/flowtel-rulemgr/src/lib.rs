//! Flow rule manager.
//!
//! Control-plane side of switch management:
//!
//! - [`FlowRuleManager`]: registration, deregistration, policy
//!   reconciliation and heartbeat supervision
//! - [`SwitchSession`]: per-switch state machine
//! - [`SwitchChannel`]: request channel to a switch, over HTTP
//!   ([`HttpSwitchChannel`]) or in-process ([`LocalSwitchChannel`])
//! - [`BackoffPolicy`]: capped exponential retry for switch requests

mod error;
pub mod backoff;
pub mod channel;
pub mod manager;
pub mod session;

pub use backoff::{with_timeout, BackoffPolicy};
pub use channel::{
    ChannelFactory, HttpChannelFactory, HttpSwitchChannel, LocalChannelFactory,
    LocalSwitchChannel, SwitchChannel,
};
pub use error::{ChannelError, Result, RuleManagerError, SessionError};
pub use manager::{FlowRuleManager, ManagerConfig, RegistrationRequest, RegistrationResponse};
pub use session::{SessionState, SwitchSession};
