//! Inbound call session
//!
//! Drives one handed-over call from the accepted control connection to the
//! closed socket:
//! - Subscribe to this call's events and ask the engine to linger
//! - Route the dialed number
//! - Answer and bridge, or reject with the routing reason
//! - Always close the control connection, whatever happened before

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use super::esl::constants::{
    HEADER_CALLER_NUMBER, HEADER_DESTINATION_NUMBER, HEADER_SIP_PROFILE, HEADER_UNIQUE_ID,
};
use super::esl::EslError;
use super::routing::{Decision, RoutingTable};
use super::stats::ServerStats;

#[cfg(test)]
mod tests;

/// Hangup cause sent when the session itself fails
pub const FAILURE_HANGUP_CAUSE: &str = "NORMAL_TEMPORARY_FAILURE";

/// Logical commands a session issues on its call
#[async_trait]
pub trait CallControl: Send {
    /// Receive events for this call only
    async fn subscribe_events(&mut self, call_id: &str) -> Result<(), EslError>;

    /// Keep events flowing after the leg hangs up. Not acknowledged.
    async fn linger(&mut self) -> Result<(), EslError>;

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), EslError>;

    async fn answer(&mut self) -> Result<(), EslError>;

    /// Start the bridge without waiting for it to complete
    async fn bridge(&mut self, dial_string: &str) -> Result<(), EslError>;

    async fn hangup(&mut self, cause: &str) -> Result<(), EslError>;

    /// Close the control side of the connection
    async fn stop(&mut self) -> Result<(), EslError>;
}

/// Per-call data from the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub call_id: String,
    pub destination_number: String,
    pub caller_number: String,
    pub signaling_profile: String,
}

impl SessionContext {
    /// Missing fields come back empty; this never fails
    pub fn from_channel_data(data: &HashMap<String, String>) -> Self {
        let field = |name: &str| data.get(name).cloned().unwrap_or_default();
        Self {
            call_id: field(HEADER_UNIQUE_ID),
            destination_number: field(HEADER_DESTINATION_NUMBER),
            caller_number: field(HEADER_CALLER_NUMBER),
            signaling_profile: field(HEADER_SIP_PROFILE),
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Control connection accepted, handshake done
    Connected,
    /// Event subscription requested
    Subscribed,
    /// Linger requested
    Lingering,
    /// Routing the call
    Deciding,
    /// Setting up and bridging
    Bridging,
    /// Hanging up with the reject reason
    Rejecting,
    /// Control connection closed
    Closed,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Connected, Subscribed)
                | (Subscribed, Lingering)
                | (Lingering, Deciding)
                | (Deciding, Bridging)
                | (Deciding, Rejecting)
        ) || (next == Closed && self != Closed)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Connected => write!(f, "Connected"),
            CallState::Subscribed => write!(f, "Subscribed"),
            CallState::Lingering => write!(f, "Lingering"),
            CallState::Deciding => write!(f, "Deciding"),
            CallState::Bridging => write!(f, "Bridging"),
            CallState::Rejecting => write!(f, "Rejecting"),
            CallState::Closed => write!(f, "Closed"),
        }
    }
}

/// How the call left this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Bridged,
    Rejected,
    Failed,
}

/// Result of running a session to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub call_id: String,
    pub disposition: Disposition,
    /// Every state the session passed through, starting at `Connected`
    pub states: Vec<CallState>,
}

impl CallOutcome {
    pub fn final_state(&self) -> CallState {
        self.states.last().copied().unwrap_or(CallState::Connected)
    }
}

/// Channel settings applied before a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSettings {
    pub ringback: String,
    /// Sent to the engine as `call_timeout`
    pub call_timeout_secs: u32,
    /// Sent per leg as `leg_timeout`
    pub leg_timeout_secs: u32,
    /// Pause between answer and bridge
    pub answer_grace: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ringback: "${us-ring}".to_string(),
            call_timeout_secs: 30,
            leg_timeout_secs: 30,
            answer_grace: Duration::from_millis(500),
        }
    }
}

impl CallSettings {
    /// Leg options followed by the comma-separated targets
    pub fn dial_string(&self, targets: &[String]) -> String {
        format!(
            "{{leg_timeout={},ignore_early_media=true}}{}",
            self.leg_timeout_secs,
            targets.join(",")
        )
    }
}

/// One call from handshake to close
pub struct CallSession<C> {
    control: C,
    context: SessionContext,
    routes: Arc<RoutingTable>,
    settings: CallSettings,
    stats: Arc<ServerStats>,
    states: Vec<CallState>,
}

impl<C: CallControl> CallSession<C> {
    pub fn new(
        control: C,
        channel_data: &HashMap<String, String>,
        routes: Arc<RoutingTable>,
        settings: CallSettings,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            control,
            context: SessionContext::from_channel_data(channel_data),
            routes,
            settings,
            stats,
            states: vec![CallState::Connected],
        }
    }

    #[cfg(test)]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> CallState {
        self.states.last().copied().unwrap_or(CallState::Connected)
    }

    /// Run the call to completion. Teardown runs exactly once, on every path.
    pub async fn run(mut self) -> CallOutcome {
        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;

        let disposition = match result {
            Ok(Ok(disposition)) => disposition,
            Ok(Err(e)) => {
                tracing::warn!("Call {} failed in {}: {}", self.context.call_id, self.state(), e);
                self.hangup_after_failure().await;
                Disposition::Failed
            }
            Err(_) => {
                tracing::error!("Call {} handler panicked in {}", self.context.call_id, self.state());
                self.hangup_after_failure().await;
                Disposition::Failed
            }
        };

        if let Err(e) = self.control.stop().await {
            tracing::debug!("Stop on call {}: {}", self.context.call_id, e);
        }
        self.transition(CallState::Closed);
        self.stats.record_disposition(disposition);

        CallOutcome {
            call_id: self.context.call_id,
            disposition,
            states: self.states,
        }
    }

    async fn drive(&mut self) -> Result<Disposition, EslError> {
        if let Err(e) = self.control.subscribe_events(&self.context.call_id).await {
            self.stats.record_subscribe_failure();
            tracing::warn!("Event subscription failed, continuing: {}", e);
        }
        self.transition(CallState::Subscribed);

        if let Err(e) = self.control.linger().await {
            self.stats.record_linger_failure();
            tracing::warn!("Linger request failed, continuing: {}", e);
        }
        self.transition(CallState::Lingering);

        self.transition(CallState::Deciding);
        tracing::info!(
            "Inbound call: {} -> {} (UUID: {}, profile: {})",
            self.context.caller_number,
            self.context.destination_number,
            self.context.call_id,
            self.context.signaling_profile,
        );

        let decision = self
            .routes
            .decide(&self.context.destination_number, &self.context.caller_number)
            .into_dialable(&self.context.destination_number);
        tracing::info!("Routing decision: {}", decision.action());

        match decision {
            Decision::Bridge { targets, domain } => {
                self.transition(CallState::Bridging);
                self.answer_and_bridge(&targets, &domain).await?;
                Ok(Disposition::Bridged)
            }
            Decision::Reject { reason } => {
                self.transition(CallState::Rejecting);
                tracing::info!("Rejecting: {}", reason);
                self.control.hangup(&reason).await?;
                Ok(Disposition::Rejected)
            }
        }
    }

    async fn answer_and_bridge(&mut self, targets: &[String], domain: &str) -> Result<(), EslError> {
        let variables = [
            ("domain_name", domain.to_string()),
            ("ringback", self.settings.ringback.clone()),
            ("call_timeout", self.settings.call_timeout_secs.to_string()),
            ("hangup_after_bridge", "true".to_string()),
            ("continue_on_fail", "true".to_string()),
        ];
        for (name, value) in &variables {
            self.control.set_variable(name, value).await?;
        }

        self.control.answer().await?;
        tracing::debug!("Answered");
        tokio::time::sleep(self.settings.answer_grace).await;

        let dial_string = self.settings.dial_string(targets);
        tracing::info!("Bridging to: {}", targets.join(","));
        self.control.bridge(&dial_string).await?;
        tracing::info!("Bridge command sent");
        Ok(())
    }

    /// Best-effort hangup, skipped if the reject hangup was already issued
    async fn hangup_after_failure(&mut self) {
        if self.state() == CallState::Rejecting {
            return;
        }
        if let Err(e) = self.control.hangup(FAILURE_HANGUP_CAUSE).await {
            tracing::debug!("Hangup after failure on call {}: {}", self.context.call_id, e);
        }
    }

    fn transition(&mut self, next: CallState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            tracing::warn!("Unexpected transition {} -> {}", current, next);
        }
        tracing::debug!("{} -> {}", current, next);
        self.states.push(next);
    }
}
