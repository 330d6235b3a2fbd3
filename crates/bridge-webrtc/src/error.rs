//! Error types for the WebRTC module.

use thiserror::Error;

/// Errors raised while negotiating or feeding transports.
#[derive(Debug, Error)]
pub enum WebRtcError {
    /// Error from the media engine.
    #[error("WebRTC error: {0}")]
    Engine(#[from] webrtc::Error),

    /// Invalid endpoint settings.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// SDP could not be parsed.
    #[error("Invalid SDP: {0}")]
    Sdp(String),

    /// The remote description does not fit the advertised capabilities.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Outgoing stream requested before both descriptions were applied.
    #[error("Transport is not bound to local and remote descriptions")]
    TransportNotBound,

    /// The transport already created its outgoing stream.
    #[error("Outgoing stream already created for transport {0}")]
    StreamAlreadyCreated(String),

    /// Writing a sample failed.
    #[error("Sample write failed: {0}")]
    Write(String),
}
