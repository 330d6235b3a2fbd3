//! Error types for the signaling module.

use std::time::Duration;

use thiserror::Error;

use crate::state::SignalingState;

/// Errors raised while talking to the gateway.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The gateway address is not a WebSocket URL.
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),

    /// The WebSocket could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The link closed while a step was in progress.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The gateway replied with something the step cannot accept.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Room join or SDP exchange did not succeed.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// No reply within the allotted time.
    #[error("Transaction {transaction} timed out after {after:?}")]
    Timeout { transaction: String, after: Duration },

    /// The gateway answered with an error message.
    #[error("Gateway error {code}: {reason}")]
    Gateway { code: i64, reason: String },

    /// A step was called out of order.
    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    /// Outgoing request could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SignalingError {
    /// Whether this error means the link itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ConnectionLost(_))
    }
}
