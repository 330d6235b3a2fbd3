//! Error types for the engine.

use bridge_ingest::IngestError;
use bridge_signaling::SignalingError;
use bridge_webrtc::WebRtcError;
use thiserror::Error;

/// Errors surfaced by bridge operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// RTMP listener or publish failure.
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Gateway state machine failure.
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Transport negotiation or relay failure.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] WebRtcError),

    /// No gateway address configured.
    #[error("Gateway publishing is not configured")]
    GatewayDisabled,

    /// Another gateway publish is running.
    #[error("Gateway publish already in progress")]
    GatewayBusy,

    /// The bridge shut down while a gateway publish was running.
    #[error("Gateway publish cancelled")]
    PublishCancelled,

    /// The publish task ended without a result.
    #[error("Gateway publish task failed: {0}")]
    PublishTask(String),

    /// A viewer sent something other than one offer.
    #[error("Invalid viewer message: {0}")]
    InvalidViewerMessage(String),
}

impl EngineError {
    /// Returns true if the failure came from the gateway link itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Signaling(e) if e.is_connection_error())
    }
}
