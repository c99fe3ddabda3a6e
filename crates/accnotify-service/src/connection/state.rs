use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `attempt` counts consecutive failures, including the one that led here.
    ReconnectPending { attempt: u32, deadline: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or connected: a further `connect()` is a no-op.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectPending { .. } => "reconnect_pending",
        }
    }

    /// Text for the persistent status surface.
    pub fn status_text(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "running",
            ConnectionState::Connecting | ConnectionState::ReconnectPending { .. } => {
                "connecting…"
            }
            ConnectionState::Disconnected => "disconnected",
        }
    }
}
