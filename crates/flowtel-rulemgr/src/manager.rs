//! Flow rule manager.
//!
//! Owns the switch sessions and keeps every live switch on the desired
//! monitoring policy. Two background loops run once started:
//!
//! - reconciliation: pushes the desired policy to live sessions that have
//!   not applied it, with capped exponential backoff
//! - heartbeat monitor: probes live sessions and degrades or disconnects
//!   the ones that stop answering
//!
//! Each session sits in its own slot with its own lock and cancellation
//! token, so a slow switch never holds up the others.

use crate::backoff::{with_timeout, BackoffPolicy};
use crate::channel::{ChannelFactory, SwitchChannel};
use crate::error::{ChannelError, Result, RuleManagerError};
use crate::session::{SessionState, SwitchSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowtel_common::{now_micros, PolicyConfig, SwitchStatusStore};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Rule manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Bound on each request to a switch.
    pub request_timeout: Duration,
    pub reconcile_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive misses after which a degraded session is disconnected.
    pub max_missed_heartbeats: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(RuleManagerError::invalid_request(
                "request_timeout",
                "must be non-zero",
            ));
        }
        if self.reconcile_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(RuleManagerError::invalid_request(
                "reconcile_interval",
                "reconcile and heartbeat intervals must be non-zero",
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(RuleManagerError::invalid_request(
                "max_missed_heartbeats",
                "must be at least 1",
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(RuleManagerError::invalid_request(
                "max_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Registration handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub switch_id: String,
    /// `ip:port` the manager reaches the switch on.
    pub control_address: String,
    #[serde(default)]
    pub device_id: String,
}

impl RegistrationRequest {
    pub fn validate(&self) -> Result<SocketAddr> {
        if self.switch_id.trim().is_empty() {
            return Err(RuleManagerError::invalid_request(
                "switch_id",
                "must not be empty",
            ));
        }
        self.control_address.parse::<SocketAddr>().map_err(|e| {
            RuleManagerError::invalid_request(
                "control_address",
                format!("{:?} is not a socket address: {}", self.control_address, e),
            )
        })
    }
}

/// Registration handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Token the switch prefixes its digest datagrams with.
    pub session_token: u64,
    pub accepted_policy: PolicyConfig,
}

struct SessionSlot {
    session: Mutex<SwitchSession>,
    channel: Arc<dyn SwitchChannel>,
    cancel: CancellationToken,
}

impl SessionSlot {
    fn snapshot(&self) -> SwitchSession {
        self.session.lock().clone()
    }
}

/// Control-plane manager for switch sessions.
pub struct FlowRuleManager {
    config: ManagerConfig,
    factory: Arc<dyn ChannelFactory>,
    status_store: Arc<dyn SwitchStatusStore>,
    sessions: DashMap<String, Arc<SessionSlot>>,
    tokens: DashMap<u64, String>,
    desired: RwLock<PolicyConfig>,
    policy_changed: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl FlowRuleManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn ChannelFactory>,
        status_store: Arc<dyn SwitchStatusStore>,
        policy: PolicyConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        policy.validate()?;
        Ok(Arc::new(Self {
            config,
            factory,
            status_store,
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            desired: RwLock::new(policy),
            policy_changed: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }))
    }

    /// Starts the reconciliation loop and the heartbeat monitor.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = manager.policy_changed.notified() => {}
                }
                manager.reconcile_once().await;
            }
            debug!("Reconciliation loop stopped");
        });

        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.check_heartbeats().await,
                }
            }
            debug!("Heartbeat monitor stopped");
        });

        info!(
            reconcile_interval_ms = self.config.reconcile_interval.as_millis() as u64,
            heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            "Flow rule manager started"
        );
    }

    /// Registers a switch and returns its session token and the policy it
    /// must apply. An existing session for the same switch is replaced.
    #[instrument(skip(self, request), fields(switch_id = %request.switch_id))]
    pub async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        request.validate()?;

        if self.remove_session(&request.switch_id).is_some() {
            info!("Replacing existing session");
        }

        let mut session = SwitchSession::new(
            request.switch_id.as_str(),
            request.device_id.as_str(),
            request.control_address.as_str(),
        );
        session.begin_registration()?;
        self.report(&session).await;

        let cancel = self.cancel.child_token();
        let timeout = self.config.request_timeout;
        let factory = &self.factory;
        let req = &request;
        let opened = self
            .config
            .backoff
            .retry("open_channel", &cancel, move || {
                with_timeout(timeout, factory.open(req))
            })
            .await;

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                session.fail_registration()?;
                self.report(&session).await;
                warn!(error = %e, "Switch registration failed");
                return Err(RuleManagerError::channel(request.switch_id, e));
            }
        };

        let token = self.allocate_token(&request.switch_id);
        let accepted_policy = self.desired_policy();
        session.activate(token, accepted_policy.clone(), now_micros())?;
        self.report(&session).await;

        let slot = Arc::new(SessionSlot {
            session: Mutex::new(session),
            channel,
            cancel,
        });
        if let Some(replaced) = self.sessions.insert(request.switch_id.clone(), slot) {
            self.retire(&replaced);
        }

        info!(
            control_address = %request.control_address,
            device_id = %request.device_id,
            "Switch registered"
        );
        Ok(RegistrationResponse {
            session_token: token,
            accepted_policy,
        })
    }

    /// Accepts a switch-initiated heartbeat. Returns the resulting state.
    pub async fn heartbeat(&self, switch_id: &str) -> Result<SessionState> {
        let slot = self.slot(switch_id)?;
        let (changed, snapshot) = {
            let mut session = slot.session.lock();
            let changed = session.record_heartbeat(now_micros())?;
            (changed, session.clone())
        };
        if changed {
            info!(switch_id = %switch_id, "Switch recovered");
            self.report(&snapshot).await;
        }
        Ok(snapshot.state)
    }

    /// Removes a switch, cancelling any request in flight for it.
    #[instrument(skip(self))]
    pub async fn deregister(&self, switch_id: &str) -> Result<()> {
        let slot = self
            .remove_session(switch_id)
            .ok_or_else(|| RuleManagerError::UnknownSwitch(switch_id.to_string()))?;

        let mut status = slot.snapshot().status(now_micros());
        status.state = "deregistered".to_string();
        if let Err(e) = self
            .status_store
            .upsert_switch_status(switch_id, status)
            .await
        {
            warn!(error = %e, "Failed to report switch status");
        }
        info!("Switch deregistered");
        Ok(())
    }

    /// Replaces the desired policy. A malformed policy is rejected and the
    /// previous one stays in force.
    pub fn update_policy(&self, policy: PolicyConfig) -> Result<()> {
        policy.validate()?;
        info!(
            sampling_rate = policy.sampling_rate_default,
            flow_timeout_secs = policy.flow_timeout_secs,
            "Desired policy updated"
        );
        *self.desired.write() = policy;
        self.policy_changed.notify_one();
        Ok(())
    }

    pub fn desired_policy(&self) -> PolicyConfig {
        self.desired.read().clone()
    }

    /// Pushes the desired policy to every live session that has not
    /// applied it. Returns the number of successful pushes.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> usize {
        let desired = self.desired_policy();
        let pending: Vec<(String, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().session.lock().needs_policy(&desired))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let results = join_all(
            pending
                .iter()
                .map(|(switch_id, slot)| self.push_policy(switch_id, slot, &desired)),
        )
        .await;
        let applied = results.into_iter().filter(|ok| *ok).count();
        info!(pending = pending.len(), applied, "Policy reconciliation pass");
        applied
    }

    async fn push_policy(&self, switch_id: &str, slot: &SessionSlot, desired: &PolicyConfig) -> bool {
        let timeout = self.config.request_timeout;
        let channel = &slot.channel;
        let result = self
            .config
            .backoff
            .retry("push_policy", &slot.cancel, move || {
                with_timeout(timeout, channel.push_policy(desired))
            })
            .await;

        match result {
            Ok(()) => {
                slot.session.lock().policy_applied(desired.clone());
                debug!(switch_id = %switch_id, "Policy applied");
                true
            }
            Err(ChannelError::Cancelled) => false,
            Err(e) => {
                let degraded = {
                    let mut session = slot.session.lock();
                    match session.mark_degraded() {
                        Ok(true) => Some(session.clone()),
                        _ => None,
                    }
                };
                warn!(switch_id = %switch_id, error = %e, "Policy push failed");
                if let Some(snapshot) = degraded {
                    self.report(&snapshot).await;
                }
                false
            }
        }
    }

    /// Probes every live session once.
    #[instrument(skip(self))]
    pub async fn check_heartbeats(&self) {
        let live: Vec<(String, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().session.lock().state.is_live())
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        join_all(
            live.iter()
                .map(|(switch_id, slot)| self.probe(switch_id, slot)),
        )
        .await;
    }

    async fn probe(&self, switch_id: &str, slot: &SessionSlot) {
        let result = tokio::select! {
            _ = slot.cancel.cancelled() => return,
            result = with_timeout(self.config.request_timeout, slot.channel.heartbeat()) => result,
        };

        let (transition, snapshot) = {
            let mut session = slot.session.lock();
            let transition = match &result {
                Ok(()) => session.record_heartbeat(now_micros()),
                Err(_) => session.record_missed_heartbeat(self.config.max_missed_heartbeats),
            };
            (transition, session.clone())
        };

        if let Err(e) = &result {
            warn!(
                switch_id = %switch_id,
                missed = snapshot.missed_heartbeats,
                error = %e,
                "Heartbeat missed"
            );
        }
        match transition {
            Ok(true) => {
                info!(switch_id = %switch_id, state = %snapshot.state, "Session state changed");
                self.report(&snapshot).await;
            }
            Ok(false) => {}
            Err(e) => debug!(switch_id = %switch_id, error = %e, "Heartbeat result ignored"),
        }
    }

    /// Snapshot of one session.
    pub fn session(&self, switch_id: &str) -> Option<SwitchSession> {
        self.sessions.get(switch_id).map(|slot| slot.snapshot())
    }

    /// Snapshots of all sessions, ordered by switch id.
    pub fn sessions(&self) -> Vec<SwitchSession> {
        let mut sessions: Vec<SwitchSession> =
            self.sessions.iter().map(|slot| slot.snapshot()).collect();
        sessions.sort_by(|a, b| a.switch_id.cmp(&b.switch_id));
        sessions
    }

    /// Switch owning `token`, if its session still accepts digests.
    pub fn switch_for_token(&self, token: u64) -> Option<String> {
        let switch_id = self.tokens.get(&token)?.value().clone();
        let state = self.sessions.get(&switch_id)?.session.lock().state;
        (state != SessionState::Disconnected).then_some(switch_id)
    }

    /// Session count per state, every state included.
    pub fn state_counts(&self) -> BTreeMap<SessionState, usize> {
        let mut counts: BTreeMap<SessionState, usize> =
            SessionState::ALL.iter().map(|s| (*s, 0)).collect();
        for slot in self.sessions.iter() {
            *counts.entry(slot.session.lock().state).or_default() += 1;
        }
        counts
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Stops the background loops and cancels outstanding requests.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(sessions = self.sessions.len(), "Flow rule manager stopped");
    }

    fn slot(&self, switch_id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .get(switch_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| RuleManagerError::UnknownSwitch(switch_id.to_string()))
    }

    fn allocate_token(&self, switch_id: &str) -> u64 {
        loop {
            let token: u64 = rand::random();
            if token == 0 {
                continue;
            }
            if let Entry::Vacant(vacant) = self.tokens.entry(token) {
                vacant.insert(switch_id.to_string());
                return token;
            }
        }
    }

    fn remove_session(&self, switch_id: &str) -> Option<Arc<SessionSlot>> {
        let (_, slot) = self.sessions.remove(switch_id)?;
        self.retire(&slot);
        Some(slot)
    }

    fn retire(&self, slot: &SessionSlot) {
        slot.cancel.cancel();
        let token = slot.session.lock().token;
        self.tokens.remove(&token);
    }

    async fn report(&self, session: &SwitchSession) {
        if let Err(e) = self
            .status_store
            .upsert_switch_status(&session.switch_id, session.status(now_micros()))
            .await
        {
            warn!(switch_id = %session.switch_id, error = %e, "Failed to report switch status");
        }
    }
}
