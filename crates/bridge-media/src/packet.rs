//! Codec packets and descriptors.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::h264::AvcDecoderConfig;

/// Media stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Codecs the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    /// H.264 / AVC video.
    H264,

    /// Opus audio.
    Opus,
}

impl CodecId {
    /// The media kind carried by this codec.
    pub fn kind(self) -> MediaKind {
        match self {
            Self::H264 => MediaKind::Video,
            Self::Opus => MediaKind::Audio,
        }
    }

    /// Codec name as it appears in SDP `rtpmap` lines.
    pub fn sdp_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::Opus => "opus",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdp_name())
    }
}

/// Codec parameters recorded when a publish starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecDescriptor {
    /// H.264 with its decoder configuration record (SPS/PPS).
    H264(AvcDecoderConfig),

    /// Opus audio.
    Opus {
        /// Sample rate in Hz (Opus always signals 48000 on the wire).
        sample_rate: u32,

        /// Number of channels.
        channels: u8,
    },
}

impl CodecDescriptor {
    /// Codec identifier for this descriptor.
    pub fn codec(&self) -> CodecId {
        match self {
            Self::H264(_) => CodecId::H264,
            Self::Opus { .. } => CodecId::Opus,
        }
    }

    /// Media kind for this descriptor.
    pub fn kind(&self) -> MediaKind {
        self.codec().kind()
    }
}

/// The pair of codec descriptors a publish must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDescriptors {
    pub audio: CodecDescriptor,
    pub video: CodecDescriptor,
}

/// A demuxed codec packet.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Stream type.
    pub kind: MediaKind,

    /// Codec of the payload.
    pub codec: CodecId,

    /// Decode timestamp in milliseconds.
    pub timestamp_ms: u32,

    /// Presentation offset from the decode timestamp (video only).
    pub composition_offset_ms: i32,

    /// Whether this is a keyframe (always true for audio).
    pub is_keyframe: bool,

    /// Codec payload (AVCC access unit for H.264, one Opus packet for audio).
    pub data: Bytes,

    /// Position in the owning track, assigned when the packet is written.
    pub sequence: u64,
}

impl MediaPacket {
    /// Create a video packet.
    pub fn video(data: Bytes, timestamp_ms: u32, composition_offset_ms: i32, is_keyframe: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            codec: CodecId::H264,
            timestamp_ms,
            composition_offset_ms,
            is_keyframe,
            data,
            sequence: 0,
        }
    }

    /// Create an audio packet.
    pub fn audio(data: Bytes, timestamp_ms: u32) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec: CodecId::Opus,
            timestamp_ms,
            composition_offset_ms: 0,
            is_keyframe: true,
            data,
            sequence: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kinds() {
        assert_eq!(CodecId::H264.kind(), MediaKind::Video);
        assert_eq!(CodecId::Opus.kind(), MediaKind::Audio);
        assert_eq!(CodecId::Opus.sdp_name(), "opus");
    }

    #[test]
    fn test_descriptor_kind() {
        let opus = CodecDescriptor::Opus {
            sample_rate: 48000,
            channels: 2,
        };
        assert_eq!(opus.kind(), MediaKind::Audio);
        assert_eq!(opus.codec(), CodecId::Opus);
    }
}
