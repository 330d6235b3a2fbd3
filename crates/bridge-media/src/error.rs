//! Error types for the media module.

use thiserror::Error;

use crate::packet::MediaKind;

/// Errors that can occur while handling media packets.
#[derive(Debug, Error)]
pub enum MediaError {
    /// A packet was written to a track of the other kind.
    #[error("Packet of kind {packet} written to {track} track")]
    KindMismatch { track: MediaKind, packet: MediaKind },

    /// Malformed AVC decoder configuration record.
    #[error("Invalid AVC decoder configuration: {0}")]
    InvalidDecoderConfig(String),

    /// Malformed length-prefixed NAL unit data.
    #[error("Invalid AVCC payload: {0}")]
    InvalidAvcc(String),
}
