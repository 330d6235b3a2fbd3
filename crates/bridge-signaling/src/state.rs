//! Signaling state machine types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a gateway session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalingState {
    /// No link to the gateway.
    #[default]
    Disconnected,

    /// WebSocket open.
    Connected,

    /// Gateway session created.
    SessionCreated { session_id: u64 },

    /// Videoroom plugin handle attached.
    PluginAttached { session_id: u64, handle_id: u64 },

    /// Joined the room as publisher.
    RoomJoined {
        session_id: u64,
        handle_id: u64,
        room: u64,
    },

    /// Answer received for the local offer.
    Negotiated {
        session_id: u64,
        handle_id: u64,
        room: u64,
    },

    /// A step failed; the session is unusable.
    Failed { reason: String },
}

impl SignalingState {
    /// Returns true once the offer/answer exchange completed.
    pub fn is_negotiated(&self) -> bool {
        matches!(self, Self::Negotiated { .. })
    }

    /// Returns true if a step failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Gateway session id, once created.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            Self::SessionCreated { session_id }
            | Self::PluginAttached { session_id, .. }
            | Self::RoomJoined { session_id, .. }
            | Self::Negotiated { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::SessionCreated { .. } => "SessionCreated",
            Self::PluginAttached { .. } => "PluginAttached",
            Self::RoomJoined { .. } => "RoomJoined",
            Self::Negotiated { .. } => "Negotiated",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "Failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Steps of the publish flow, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingPhase {
    /// Opening the WebSocket.
    Connect,

    /// Creating the gateway session.
    CreateSession,

    /// Attaching the videoroom plugin.
    AttachPlugin,

    /// Joining the room as publisher.
    JoinRoom,

    /// Exchanging offer and answer.
    Negotiate,
}

impl SignalingPhase {
    /// The first step.
    pub fn first() -> Self {
        Self::Connect
    }

    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Connect => Some(Self::CreateSession),
            Self::CreateSession => Some(Self::AttachPlugin),
            Self::AttachPlugin => Some(Self::JoinRoom),
            Self::JoinRoom => Some(Self::Negotiate),
            Self::Negotiate => None,
        }
    }

    /// The phase that may run from a given state, if any.
    pub fn for_state(state: &SignalingState) -> Option<Self> {
        match state {
            SignalingState::Disconnected => Some(Self::Connect),
            SignalingState::Connected => Some(Self::CreateSession),
            SignalingState::SessionCreated { .. } => Some(Self::AttachPlugin),
            SignalingState::PluginAttached { .. } => Some(Self::JoinRoom),
            SignalingState::RoomJoined { .. } => Some(Self::Negotiate),
            SignalingState::Negotiated { .. } | SignalingState::Failed { .. } => None,
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "Connecting to gateway",
            Self::CreateSession => "Creating session",
            Self::AttachPlugin => "Attaching plugin",
            Self::JoinRoom => "Joining room",
            Self::Negotiate => "Negotiating media",
        }
    }

    /// Short verb used in error messages.
    pub fn operation(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::CreateSession => "create session",
            Self::AttachPlugin => "attach plugin",
            Self::JoinRoom => "join room",
            Self::Negotiate => "negotiate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phase = SignalingPhase::first();
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&SignalingPhase::Negotiate));
    }

    #[test]
    fn test_phase_for_state() {
        assert_eq!(
            SignalingPhase::for_state(&SignalingState::Disconnected),
            Some(SignalingPhase::Connect)
        );
        assert_eq!(
            SignalingPhase::for_state(&SignalingState::PluginAttached {
                session_id: 1,
                handle_id: 2
            }),
            Some(SignalingPhase::JoinRoom)
        );
        assert_eq!(
            SignalingPhase::for_state(&SignalingState::Failed {
                reason: "x".to_string()
            }),
            None
        );
    }

    #[test]
    fn test_state_serializes_tagged() {
        let json = serde_json::to_value(SignalingState::SessionCreated { session_id: 7 }).unwrap();
        assert_eq!(json["state"], "session_created");
        assert_eq!(json["session_id"], 7);
    }

    #[test]
    fn test_session_id() {
        assert_eq!(SignalingState::Connected.session_id(), None);
        assert_eq!(
            SignalingState::RoomJoined {
                session_id: 1,
                handle_id: 2,
                room: 3
            }
            .session_id(),
            Some(1)
        );
    }
}
