//! Error types for the ingest module.

use bridge_media::MediaError;
use thiserror::Error;

/// Errors that can occur while ingesting an RTMP publish.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Could not bind the RTMP listener.
    #[error("Failed to bind RTMP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// RTMP handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// RTMP session error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// The publisher sent a codec the bridge cannot relay.
    #[error("Codec mismatch: {0}")]
    CodecMismatch(String),

    /// Malformed FLV tag payload.
    #[error("Invalid FLV tag: {0}")]
    InvalidTag(String),

    /// Publish request refused by policy.
    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    /// Operation for a publish that no longer owns the slot.
    #[error("Publish {0} is not active")]
    NotPublishing(u64),

    /// Media layer error.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
