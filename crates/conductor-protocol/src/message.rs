//! Lines sent from the server to connected peers.

use std::fmt;

/// A server-initiated line.
///
/// `Display` renders the line without its terminator; the session adds one
/// when sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Periodic heartbeat from the communication tick
    Heartbeat { tick: u64, origin: String },

    /// Reply to a client line
    Echo(String),

    /// Text broadcast to every session
    Broadcast(String),
}

impl ServerMessage {
    /// Creates a heartbeat for `tick` announced by `origin`.
    pub fn heartbeat(tick: u64, origin: impl Into<String>) -> Self {
        Self::Heartbeat {
            tick,
            origin: origin.into(),
        }
    }

    /// Creates an echo reply.
    pub fn echo(line: impl Into<String>) -> Self {
        Self::Echo(line.into())
    }

    /// Creates a broadcast line.
    pub fn broadcast(message: impl Into<String>) -> Self {
        Self::Broadcast(message.into())
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat { tick, origin } => write!(f, "Tick {tick} from {origin}."),
            Self::Echo(line) => write!(f, "Echo: {line}"),
            Self::Broadcast(message) => write!(f, "Broadcast: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_format() {
        assert_eq!(
            ServerMessage::heartbeat(7, "Conductor").to_string(),
            "Tick 7 from Conductor."
        );
    }

    #[test]
    fn test_echo_format() {
        assert_eq!(ServerMessage::echo("ping").to_string(), "Echo: ping");
    }

    #[test]
    fn test_broadcast_format() {
        assert_eq!(
            ServerMessage::broadcast("restart in 5").to_string(),
            "Broadcast: restart in 5"
        );
    }
}
