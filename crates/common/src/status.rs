//! Runtime status snapshots
//!
//! Every stage publishes its status through a `tokio::sync::watch` channel;
//! [`StatusBoard`] holds the receiving ends and assembles a
//! [`PipelineStatus`] on demand for the status surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::Source;

/// Stream session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Connected,
    /// Connected but no activity seen for more than one heartbeat interval
    Degraded,
    Reconnecting,
    Disconnected,
}

impl SessionState {
    /// Numeric encoding for the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            SessionState::Disconnected => 0.0,
            SessionState::Connecting => 1.0,
            SessionState::Connected => 2.0,
            SessionState::Degraded => 3.0,
            SessionState::Reconnecting => 4.0,
        }
    }

    /// True while the session is delivering data
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Degraded => write!(f, "DEGRADED"),
            SessionState::Reconnecting => write!(f, "RECONNECTING"),
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Point-in-time view of one stream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub source: Source,
    pub state: SessionState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub reconnect_attempt: u32,
    pub subscribed_keys: usize,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub last_error: Option<String>,
    /// When the next connect attempt is scheduled, while reconnecting
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            state: SessionState::Disconnected,
            last_heartbeat_at: None,
            last_message_at: None,
            reconnect_attempt: 0,
            subscribed_keys: 0,
            messages_delivered: 0,
            messages_dropped: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Supervisor-wide health derived from its sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    /// Every session is connected
    Healthy,
    /// At least one session is live, but not all
    Degraded,
    /// No session is live
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub overall: OverallHealth,
    pub sessions: Vec<SessionSnapshot>,
}

impl SupervisorStatus {
    pub fn from_sessions(sessions: Vec<SessionSnapshot>) -> Self {
        let live = sessions.iter().filter(|s| s.state.is_live()).count();
        let connected = sessions
            .iter()
            .filter(|s| s.state == SessionState::Connected)
            .count();

        let overall = if !sessions.is_empty() && connected == sessions.len() {
            OverallHealth::Healthy
        } else if live > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Down
        };

        Self { overall, sessions }
    }

    pub fn session(&self, source: Source) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.source == source)
    }
}

/// Circuit breaker state guarding the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterStatus {
    pub running: bool,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub buffered_records: u64,
    pub replay_in_progress: bool,
    pub rows_persisted: u64,
    pub malformed_dropped: u64,
    pub p95_latency_ms: Option<f64>,
    pub latency_target_ms: f64,
}

impl Default for WriterStatus {
    fn default() -> Self {
        Self {
            running: false,
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            buffered_records: 0,
            replay_in_progress: false,
            rows_persisted: 0,
            malformed_dropped: 0,
            p95_latency_ms: None,
            latency_target_ms: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub rejected: u64,
}

/// Everything the status surface reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub generated_at: DateTime<Utc>,
    pub supervisor: SupervisorStatus,
    pub normalizer: NormalizerStats,
    pub writer: WriterStatus,
}

impl PipelineStatus {
    /// Healthy enough to serve: some feed is live and the writer is running
    pub fn is_healthy(&self) -> bool {
        self.writer.running && self.supervisor.overall != OverallHealth::Down
    }
}

/// Receiving ends of every stage's status channel
#[derive(Debug, Clone)]
pub struct StatusBoard {
    sessions: Vec<watch::Receiver<SessionSnapshot>>,
    normalizer: watch::Receiver<NormalizerStats>,
    writer: watch::Receiver<WriterStatus>,
}

impl StatusBoard {
    pub fn new(
        sessions: Vec<watch::Receiver<SessionSnapshot>>,
        normalizer: watch::Receiver<NormalizerStats>,
        writer: watch::Receiver<WriterStatus>,
    ) -> Self {
        Self {
            sessions,
            normalizer,
            writer,
        }
    }

    pub fn supervisor(&self) -> SupervisorStatus {
        SupervisorStatus::from_sessions(self.sessions.iter().map(|rx| rx.borrow().clone()).collect())
    }

    pub fn snapshot(&self) -> PipelineStatus {
        PipelineStatus {
            generated_at: Utc::now(),
            supervisor: self.supervisor(),
            normalizer: *self.normalizer.borrow(),
            writer: self.writer.borrow().clone(),
        }
    }
}
