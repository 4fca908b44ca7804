//! Switch session state machine.
//!
//! ```text
//! Unregistered ──▶ Registering ──▶ Active ◀──▶ Degraded ──▶ Disconnected
//!       ▲               │
//!       └───────────────┘ (registration failed)
//! ```
//!
//! Disconnected is terminal; a switch comes back only by registering again,
//! which creates a new session.

use crate::error::SessionError;
use flowtel_common::{PolicyConfig, SwitchStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a switch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unregistered,
    Registering,
    Active,
    Degraded,
    Disconnected,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Unregistered,
        SessionState::Registering,
        SessionState::Active,
        SessionState::Degraded,
        SessionState::Disconnected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unregistered => "unregistered",
            SessionState::Registering => "registering",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::Disconnected => "disconnected",
        }
    }

    /// Active or Degraded: the session is probed and receives policy.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Degraded)
    }

    /// Whether `self -> next` is an allowed edge.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Active)
                | (Registering, Unregistered)
                | (Active, Degraded)
                | (Degraded, Active)
                | (Degraded, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One switch's control-plane session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchSession {
    pub switch_id: String,
    pub device_id: String,
    pub control_address: String,
    #[serde(skip_serializing)]
    pub token: u64,
    pub state: SessionState,
    /// Last successful heartbeat, µs since epoch.
    pub last_heartbeat: Option<u64>,
    pub missed_heartbeats: u32,
    pub last_applied_policy: Option<PolicyConfig>,
}

impl SwitchSession {
    /// Creates an Unregistered session.
    pub fn new(
        switch_id: impl Into<String>,
        device_id: impl Into<String>,
        control_address: impl Into<String>,
    ) -> Self {
        Self {
            switch_id: switch_id.into(),
            device_id: device_id.into(),
            control_address: control_address.into(),
            token: 0,
            state: SessionState::Unregistered,
            last_heartbeat: None,
            missed_heartbeats: 0,
            last_applied_policy: None,
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Unregistered -> Registering.
    pub fn begin_registration(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Registering)
    }

    /// Registering -> Unregistered.
    pub fn fail_registration(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Unregistered)
    }

    /// Registering -> Active. The accepted policy counts as applied.
    pub fn activate(
        &mut self,
        token: u64,
        accepted_policy: PolicyConfig,
        now: u64,
    ) -> Result<(), SessionError> {
        self.transition(SessionState::Active)?;
        self.token = token;
        self.last_heartbeat = Some(now);
        self.missed_heartbeats = 0;
        self.last_applied_policy = Some(accepted_policy);
        Ok(())
    }

    /// Records a successful heartbeat. Returns true if the state changed.
    pub fn record_heartbeat(&mut self, now: u64) -> Result<bool, SessionError> {
        let changed = match self.state {
            SessionState::Active => false,
            SessionState::Degraded => {
                self.transition(SessionState::Active)?;
                true
            }
            from => {
                return Err(SessionError::InvalidTransition {
                    from,
                    to: SessionState::Active,
                })
            }
        };
        self.last_heartbeat = Some(now);
        self.missed_heartbeats = 0;
        Ok(changed)
    }

    /// Records a missed heartbeat. Returns true if the state changed.
    ///
    /// The first miss degrades an Active session; a Degraded session is
    /// disconnected once `max_missed` consecutive misses are reached.
    pub fn record_missed_heartbeat(&mut self, max_missed: u32) -> Result<bool, SessionError> {
        match self.state {
            SessionState::Active => {
                self.missed_heartbeats = self.missed_heartbeats.saturating_add(1);
                self.transition(SessionState::Degraded)?;
                Ok(true)
            }
            SessionState::Degraded => {
                self.missed_heartbeats = self.missed_heartbeats.saturating_add(1);
                if self.missed_heartbeats >= max_missed {
                    self.transition(SessionState::Disconnected)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            from => Err(SessionError::InvalidTransition {
                from,
                to: SessionState::Degraded,
            }),
        }
    }

    /// Active -> Degraded after repeated failures. Returns true if the
    /// state changed; a Degraded session is left as is.
    pub fn mark_degraded(&mut self) -> Result<bool, SessionError> {
        match self.state {
            SessionState::Degraded => Ok(false),
            _ => self.transition(SessionState::Degraded).map(|_| true),
        }
    }

    /// True if the session is live and has not applied `desired`.
    pub fn needs_policy(&self, desired: &PolicyConfig) -> bool {
        self.state.is_live() && self.last_applied_policy.as_ref() != Some(desired)
    }

    pub fn policy_applied(&mut self, policy: PolicyConfig) {
        self.last_applied_policy = Some(policy);
    }

    /// Status row for the switch status store.
    pub fn status(&self, now: u64) -> SwitchStatus {
        SwitchStatus {
            switch_id: self.switch_id.clone(),
            device_id: self.device_id.clone(),
            control_address: self.control_address.clone(),
            state: self.state.as_str().to_string(),
            missed_heartbeats: self.missed_heartbeats,
            last_heartbeat: self.last_heartbeat,
            updated_at: now,
        }
    }
}
