//! Publisher connection state.

use serde::{Deserialize, Serialize};

/// Lifecycle of one RTMP publisher connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublisherState {
    /// Exchanging C0/C1/C2 and S0/S1/S2.
    Handshaking,

    /// RTMP `connect` accepted for an application.
    Connected { app_name: String },

    /// Publish accepted; media flows once both codecs are known.
    Publishing { app_name: String, stream_key: String },

    /// Connection finished.
    Closed { reason: String },
}

impl PublisherState {
    /// Check if the publish has been accepted.
    pub fn is_publishing(&self) -> bool {
        matches!(self, Self::Publishing { .. })
    }

    /// Check if the connection is over.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Short name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Connected { .. } => "connected",
            Self::Publishing { .. } => "publishing",
            Self::Closed { .. } => "closed",
        }
    }

    /// Human readable status.
    pub fn message(&self) -> String {
        match self {
            Self::Handshaking => "Handshaking".to_string(),
            Self::Connected { app_name } => format!("Connected to '{}'", app_name),
            Self::Publishing {
                app_name,
                stream_key,
            } => format!("Publishing '{}/{}'", app_name, stream_key),
            Self::Closed { reason } => format!("Closed: {}", reason),
        }
    }
}

impl Default for PublisherState {
    fn default() -> Self {
        Self::Handshaking
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_state_predicates() {
        let state = PublisherState::Publishing {
            app_name: "live".to_string(),
            stream_key: "abc".to_string(),
        };
        assert!(state.is_publishing());
        assert!(!state.is_closed());
        assert_eq!(state.name(), "publishing");
        assert_eq!(state.message(), "Publishing 'live/abc'");
    }

    #[test]
    fn test_default_is_handshaking() {
        assert_eq!(PublisherState::default(), PublisherState::Handshaking);
    }
}
