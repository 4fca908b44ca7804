//! Control channels from the manager to switches.
//!
//! A [`SwitchChannel`] carries the two requests the manager makes of a
//! registered switch: install a policy and answer a heartbeat probe.
//! Channels are opened at registration time by a [`ChannelFactory`].

use crate::error::ChannelError;
use crate::RegistrationRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use flowtel_common::PolicyConfig;
use flowtel_dataplane::FlowPipeline;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Request channel to one switch.
#[async_trait]
pub trait SwitchChannel: Send + Sync {
    /// Installs `policy` on the switch.
    async fn push_policy(&self, policy: &PolicyConfig) -> Result<(), ChannelError>;

    /// Liveness probe.
    async fn heartbeat(&self) -> Result<(), ChannelError>;
}

/// Opens channels for registering switches.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Arc<dyn SwitchChannel>, ChannelError>;
}

/// HTTP channel: `POST {addr}/policy` with a JSON body and
/// `GET {addr}/heartbeat`.
#[derive(Debug, Clone)]
pub struct HttpSwitchChannel {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSwitchChannel {
    /// Creates a channel towards `control_address` (`host:port`).
    pub fn new(control_address: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("http://{}", control_address),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn check_status(response: reqwest::Response) -> Result<(), ChannelError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(ChannelError::Transport(format!("server error {}", status)))
        } else {
            Err(ChannelError::Rejected(format!("status {}", status)))
        }
    }
}

fn map_reqwest(e: reqwest::Error, timeout: Duration) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Timeout(timeout)
    } else {
        ChannelError::Transport(e.to_string())
    }
}

#[async_trait]
impl SwitchChannel for HttpSwitchChannel {
    async fn push_policy(&self, policy: &PolicyConfig) -> Result<(), ChannelError> {
        let url = format!("{}/policy", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(policy)
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.timeout))?;
        Self::check_status(response)
    }

    async fn heartbeat(&self) -> Result<(), ChannelError> {
        let url = format!("{}/heartbeat", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_reqwest(e, self.timeout))?;
        Self::check_status(response)
    }
}

/// Opens [`HttpSwitchChannel`]s.
#[derive(Debug, Clone)]
pub struct HttpChannelFactory {
    timeout: Duration,
}

impl HttpChannelFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ChannelFactory for HttpChannelFactory {
    async fn open(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Arc<dyn SwitchChannel>, ChannelError> {
        let channel = HttpSwitchChannel::new(&request.control_address, self.timeout)
            .map_err(|e| match e {
                ChannelError::Transport(msg) => ChannelError::Rejected(msg),
                other => other,
            })?;
        debug!(switch_id = %request.switch_id, url = %channel.base_url(), "Opened HTTP channel");
        Ok(Arc::new(channel))
    }
}

/// In-process channel driving a [`FlowPipeline`] directly.
pub struct LocalSwitchChannel {
    pipeline: Arc<FlowPipeline>,
    reachable: AtomicBool,
    policies_applied: AtomicU64,
}

impl LocalSwitchChannel {
    pub fn new(pipeline: Arc<FlowPipeline>) -> Self {
        Self {
            pipeline,
            reachable: AtomicBool::new(true),
            policies_applied: AtomicU64::new(0),
        }
    }

    /// Simulates the switch going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn pipeline(&self) -> &Arc<FlowPipeline> {
        &self.pipeline
    }

    /// Number of policies installed through this channel.
    pub fn policies_applied(&self) -> u64 {
        self.policies_applied.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<(), ChannelError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Transport("switch unreachable".to_string()))
        }
    }
}

#[async_trait]
impl SwitchChannel for LocalSwitchChannel {
    async fn push_policy(&self, policy: &PolicyConfig) -> Result<(), ChannelError> {
        self.check_reachable()?;
        self.pipeline
            .apply_policy(policy)
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;
        self.policies_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), ChannelError> {
        self.check_reachable()
    }
}

/// Factory resolving in-process switches by id, optionally falling back to
/// another factory for switches it does not know.
#[derive(Default)]
pub struct LocalChannelFactory {
    switches: DashMap<String, Arc<LocalSwitchChannel>>,
    fallback: Option<Arc<dyn ChannelFactory>>,
}

impl LocalChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<dyn ChannelFactory>) -> Self {
        Self {
            switches: DashMap::new(),
            fallback: Some(fallback),
        }
    }

    /// Makes an in-process switch available for registration.
    pub fn add_switch(&self, switch_id: impl Into<String>, channel: Arc<LocalSwitchChannel>) {
        self.switches.insert(switch_id.into(), channel);
    }

    pub fn switch(&self, switch_id: &str) -> Option<Arc<LocalSwitchChannel>> {
        self.switches.get(switch_id).map(|c| Arc::clone(c.value()))
    }
}

#[async_trait]
impl ChannelFactory for LocalChannelFactory {
    async fn open(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Arc<dyn SwitchChannel>, ChannelError> {
        if let Some(channel) = self.switch(&request.switch_id) {
            channel.heartbeat().await?;
            let channel: Arc<dyn SwitchChannel> = channel;
            return Ok(channel);
        }
        match &self.fallback {
            Some(fallback) => fallback.open(request).await,
            None => Err(ChannelError::Rejected(format!(
                "no local switch {}",
                request.switch_id
            ))),
        }
    }
}
