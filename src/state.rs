//! Connection lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-connection lifecycle state.
///
/// Progression is mostly linear with a few skipping branches; `Closed` is
/// the sole terminal state and can be entered from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Inbound socket accepted, nothing processed yet.
    Connected,
    /// Waiting for the client to present its validation token.
    WaitingForValidation,
    ValidationPassed,
    ValidationFailed,
    /// Dialing the configured upstream endpoint.
    ConnectingUpstream,
    UpstreamConnectFailed,
    UpstreamConnected,
    /// Both legs are up and the relay loops are running.
    TunnelEstablished,
    /// The inbound peer went away first.
    ClientDisconnected,
    /// The upstream peer went away first.
    ServerDisconnected,
    /// Terminal: both sockets released.
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Relay direction, fixed per copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound peer towards upstream.
    Up,
    /// Upstream towards inbound peer.
    Down,
}

impl Direction {
    /// Disconnect state reported when the loop reading in this direction ends:
    /// the up-copying loop is the one that notices the client vanishing, the
    /// down-copying loop notices the upstream server vanishing.
    pub fn disconnect_state(self) -> ConnectionState {
        match self {
            Direction::Up => ConnectionState::ClientDisconnected,
            Direction::Down => ConnectionState::ServerDisconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::TunnelEstablished.is_terminal());
        assert!(!ConnectionState::ValidationFailed.is_terminal());
    }

    #[test]
    fn test_disconnect_states() {
        assert_eq!(
            Direction::Up.disconnect_state(),
            ConnectionState::ClientDisconnected
        );
        assert_eq!(
            Direction::Down.disconnect_state(),
            ConnectionState::ServerDisconnected
        );
    }
}
