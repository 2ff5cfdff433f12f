use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

/// Lifecycle of one managed source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Edges of the lifecycle graph. Any state may return to `Disconnected`.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        if to == Disconnected {
            return true;
        }
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Streaming)
                | (Streaming, Reconnecting)
                | (Reconnecting, Streaming)
                | (Reconnecting, Failed)
        )
    }

    /// Validate an edge. A self-transition is accepted as a no-op.
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState> {
        if self == to || self.can_transition(to) {
            Ok(to)
        } else {
            Err(anyhow!("illegal connection transition {} -> {}", self, to))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
