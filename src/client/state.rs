//! Pure connection lifecycle logic
//!
//! Everything in this module is side-effect free apart from logging: the
//! dispatcher feeds [`ConnectionEvent`]s in, applies the returned state and
//! acts on [`ReconnectionDecision`]s.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Built but not connected, or gave up reconnecting
    Disconnected,
    /// First dial in progress, waiting for ConnAck
    Connecting,
    /// Session established
    Connected,
    /// Redialing after a loss (attempt number, starting at 1)
    Reconnecting(u32),
    /// `destroy()` called, shutting down
    Closing,
    /// Terminal
    Destroyed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Closing or Destroyed
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Destroyed)
    }

    pub fn is_dialing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnAckAccepted,
    /// Handshake failed; `retry_attempt` is the next attempt if the policy allows one
    ConnectFailed { retry_attempt: Option<u32> },
    /// Established session dropped
    TransportLost { retry_attempt: Option<u32> },
    CloseRequested,
    Closed,
}

/// Transition table for the client lifecycle
pub struct ConnectionMachine;

impl ConnectionMachine {
    /// Next state for `event` in `current`, or `None` if the event does not apply
    pub fn determine_next_state(
        current: &ConnectionState,
        event: &ConnectionEvent,
    ) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (current, event) {
            (S::Destroyed, _) => return None,
            (S::Closing, E::Closed) => S::Destroyed,
            (S::Closing, _) => return None,
            (_, E::CloseRequested) => S::Closing,

            (S::Disconnected, E::ConnectRequested) => S::Connecting,

            (S::Connecting | S::Reconnecting(_), E::ConnAckAccepted) => S::Connected,
            (
                S::Connecting | S::Reconnecting(_),
                E::ConnectFailed { retry_attempt } | E::TransportLost { retry_attempt },
            ) => retry_attempt.map_or(S::Disconnected, S::Reconnecting),

            (S::Connected, E::TransportLost { retry_attempt }) => {
                retry_attempt.map_or(S::Disconnected, S::Reconnecting)
            }

            _ => return None,
        };
        Some(next)
    }

    /// Log connection state transition
    pub fn log_state_transition(identity: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client = identity, "MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(client = identity, attempt, "reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!(client = identity, "MQTT connection lost, reconnecting");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(client = identity, "MQTT connection lost, not reconnecting");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Disconnected) => {
                error!(client = identity, "giving up reconnecting");
            }
            _ => {
                debug!(client = identity, "connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay before the first redial
    #[serde(default = "default_first_delay_ms")]
    pub first_delay_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Also retry when the very first connect fails
    #[serde(default)]
    pub retry_initial_connect: bool,
}

fn default_first_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            first_delay_ms: default_first_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_initial_connect: false,
        }
    }
}

impl ReconnectConfig {
    /// Backoff for `attempt` (1-based): `first * factor^(attempt-1)`, capped
    pub fn calculate_backoff_delay(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.first_delay_ms as f64 * factor.max(1.0).powi(exponent);
        let capped = if delay.is_finite() {
            delay.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unset for unlimited".to_string());
        }
        if self.first_delay_ms == 0 {
            return Err("first_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.first_delay_ms {
            return Err("max_delay_ms must not be smaller than first_delay_ms".to_string());
        }
        Ok(())
    }

    /// Decide whether another attempt should be made after `current_attempts` failures
    pub fn should_attempt_reconnection(
        &self,
        current_attempts: u32,
        factor: f64,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: self.calculate_backoff_delay(attempt, factor),
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl ReconnectionDecision {
    pub fn retry_attempt(&self) -> Option<u32> {
        match self {
            ReconnectionDecision::Proceed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

/// Sleep unless shutdown is signalled first
/// Returns true if sleep completed, false if shutdown requested
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                debug!("shutdown signalled during delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
