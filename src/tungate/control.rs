use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// A request sent from the admin surface (or CLI `--profile` boot path) to the supervisor.
#[derive(Debug)]
pub enum Command {
    Start {
        profile_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop {
        force: bool,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    StatusQuery {
        reply: oneshot::Sender<StatusEvent>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    ProxyError,
    Disconnected,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::ProxyError => "proxy_error",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub state: SessionState,
    pub profile_id: Option<String>,
    pub public_ip: Option<String>,
    pub is_connected: bool,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub message: Option<String>,
    pub since_unix_ms: u64,
}

impl StatusEvent {
    pub fn idle() -> Self {
        StatusEvent {
            state: SessionState::Idle,
            profile_id: None,
            public_ip: None,
            is_connected: false,
            duration_ms: 0,
            bytes_up: 0,
            bytes_down: 0,
            message: None,
            since_unix_ms: crate::tungate::telemetry::now_unix_ms(),
        }
    }
}

/// Command channel capacity: admin API calls are rare relative to flow traffic, a small
/// backlog is plenty and keeps `Sender::send` from blocking a request handler for long.
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

pub fn command_channel() -> (mpsc::Sender<Command>, mpsc::Receiver<Command>) {
    mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}
