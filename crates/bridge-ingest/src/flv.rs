//! FLV tag demuxing.
//!
//! RTMP carries audio and video as FLV tag bodies. This module understands
//! the two layouts the bridge can relay:
//!
//! - **Video**: AVC (codec id 7) in the legacy header, or the Enhanced RTMP
//!   extended header with FourCC `avc1`.
//! - **Audio**: Opus, either as legacy sound format 13 with the raw packet
//!   following the one-byte header, or the Enhanced RTMP extended audio
//!   header (sound format 9) with FourCC `Opus`.
//!
//! Anything else is a codec mismatch. [`FlvDemuxer`] collects codec
//! parameters per publish and declares the publish started once both the
//! AVC decoder configuration and the first Opus tag have been seen.

use bytes::Bytes;
use tracing::{debug, trace};

use bridge_media::h264::AvcDecoderConfig;
use bridge_media::{CodecDescriptor, MediaPacket, PublishDescriptors};

use crate::error::IngestError;
use crate::IngestResult;

/// Legacy FLV video codec id for AVC.
const VIDEO_CODEC_AVC: u8 = 7;

/// Legacy sound format used for Opus.
const SOUND_FORMAT_OPUS: u8 = 13;

/// Sound format signalling the Enhanced RTMP audio header.
const SOUND_FORMAT_EX_HEADER: u8 = 9;

/// Opus always runs at 48 kHz on the wire.
const OPUS_SAMPLE_RATE: u32 = 48_000;

const FOURCC_AVC: &[u8; 4] = b"avc1";
const FOURCC_OPUS: &[u8; 4] = b"Opus";

/// A decoded video tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoTag {
    /// AVC decoder configuration record.
    SequenceHeader(Bytes),

    /// One AVCC access unit.
    Frame {
        data: Bytes,
        composition_offset_ms: i32,
        is_keyframe: bool,
    },

    /// End of sequence marker.
    EndOfSequence,

    /// Command/info frame with no picture data.
    Ignored,
}

/// A decoded audio tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTag {
    /// Opus stream parameters (from an `OpusHead` or the legacy header).
    Config { channels: u8 },

    /// One Opus packet, with channel count when the header carries it.
    Frame { data: Bytes, channels: Option<u8> },

    /// Tag carries nothing to relay.
    Ignored,
}

/// Parse one FLV video tag body.
pub fn parse_video_tag(data: &Bytes) -> IngestResult<VideoTag> {
    let first = *data
        .first()
        .ok_or_else(|| IngestError::InvalidTag("empty video tag".to_string()))?;

    if first & 0x80 != 0 {
        return parse_ex_video_tag(data);
    }

    let frame_type = first >> 4;
    let codec_id = first & 0x0F;

    if frame_type == 5 {
        return Ok(VideoTag::Ignored);
    }
    if codec_id != VIDEO_CODEC_AVC {
        return Err(IngestError::CodecMismatch(format!(
            "video codec id {} is not H.264",
            codec_id
        )));
    }
    if data.len() < 5 {
        return Err(IngestError::InvalidTag(format!(
            "AVC video tag too short: {} bytes",
            data.len()
        )));
    }

    let cts = read_i24(&data[2..5]);
    match data[1] {
        0 => Ok(VideoTag::SequenceHeader(data.slice(5..))),
        1 => Ok(VideoTag::Frame {
            data: data.slice(5..),
            composition_offset_ms: cts,
            is_keyframe: frame_type == 1,
        }),
        2 => Ok(VideoTag::EndOfSequence),
        other => Err(IngestError::InvalidTag(format!(
            "unknown AVC packet type {}",
            other
        ))),
    }
}

fn parse_ex_video_tag(data: &Bytes) -> IngestResult<VideoTag> {
    if data.len() < 5 {
        return Err(IngestError::InvalidTag(
            "extended video header too short".to_string(),
        ));
    }
    let frame_type = (data[0] >> 4) & 0x07;
    let packet_type = data[0] & 0x0F;

    if frame_type == 5 {
        return Ok(VideoTag::Ignored);
    }
    if &data[1..5] != FOURCC_AVC {
        return Err(IngestError::CodecMismatch(format!(
            "video FourCC {:?} is not avc1",
            String::from_utf8_lossy(&data[1..5])
        )));
    }

    let is_keyframe = frame_type == 1;
    match packet_type {
        0 => Ok(VideoTag::SequenceHeader(data.slice(5..))),
        1 => {
            if data.len() < 8 {
                return Err(IngestError::InvalidTag(
                    "coded frame missing composition time".to_string(),
                ));
            }
            Ok(VideoTag::Frame {
                data: data.slice(8..),
                composition_offset_ms: read_i24(&data[5..8]),
                is_keyframe,
            })
        }
        2 => Ok(VideoTag::EndOfSequence),
        3 => Ok(VideoTag::Frame {
            data: data.slice(5..),
            composition_offset_ms: 0,
            is_keyframe,
        }),
        // Metadata and multitrack packets carry nothing the relay uses.
        _ => Ok(VideoTag::Ignored),
    }
}

/// Parse one FLV audio tag body.
pub fn parse_audio_tag(data: &Bytes) -> IngestResult<AudioTag> {
    let first = *data
        .first()
        .ok_or_else(|| IngestError::InvalidTag("empty audio tag".to_string()))?;
    let sound_format = first >> 4;

    match sound_format {
        SOUND_FORMAT_OPUS => {
            let channels = if first & 0x01 == 1 { 2 } else { 1 };
            if data.len() == 1 {
                return Ok(AudioTag::Config { channels });
            }
            Ok(AudioTag::Frame {
                data: data.slice(1..),
                channels: Some(channels),
            })
        }
        SOUND_FORMAT_EX_HEADER => parse_ex_audio_tag(data),
        other => Err(IngestError::CodecMismatch(format!(
            "audio sound format {} is not Opus",
            other
        ))),
    }
}

fn parse_ex_audio_tag(data: &Bytes) -> IngestResult<AudioTag> {
    if data.len() < 5 {
        return Err(IngestError::InvalidTag(
            "extended audio header too short".to_string(),
        ));
    }
    let packet_type = data[0] & 0x0F;
    if &data[1..5] != FOURCC_OPUS {
        return Err(IngestError::CodecMismatch(format!(
            "audio FourCC {:?} is not Opus",
            String::from_utf8_lossy(&data[1..5])
        )));
    }

    match packet_type {
        0 => Ok(AudioTag::Config {
            channels: opus_head_channels(&data[5..])?,
        }),
        1 => Ok(AudioTag::Frame {
            data: data.slice(5..),
            channels: None,
        }),
        _ => Ok(AudioTag::Ignored),
    }
}

/// Channel count from an `OpusHead` identification header.
fn opus_head_channels(head: &[u8]) -> IngestResult<u8> {
    if head.len() < 10 || &head[..8] != b"OpusHead" {
        return Err(IngestError::InvalidTag(
            "Opus sequence start without OpusHead".to_string(),
        ));
    }
    Ok(head[9])
}

/// Sign-extend a big-endian 24-bit value.
fn read_i24(b: &[u8]) -> i32 {
    let v = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
    (v << 8) >> 8
}

/// Output of the demuxer for one tag.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// Both codecs are known; the publish can start.
    Started(PublishDescriptors),

    /// A packet for the live publish.
    Packet(MediaPacket),
}

/// Per-publish demux state.
#[derive(Debug, Default)]
pub struct FlvDemuxer {
    video: Option<AvcDecoderConfig>,
    audio_channels: Option<u8>,
    started: bool,
    skipped: u64,
}

impl FlvDemuxer {
    /// Create a demuxer for a new publish.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the publish start has been declared.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Packets discarded because they arrived before the publish started.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Feed one video tag body.
    pub fn push_video(&mut self, data: &Bytes, timestamp_ms: u32) -> IngestResult<Vec<DemuxEvent>> {
        let mut events = Vec::new();
        match parse_video_tag(data)? {
            VideoTag::SequenceHeader(record) => {
                let config = AvcDecoderConfig::parse(&record)?;
                debug!(profile_level_id = %config.profile_level_id(), "AVC sequence header");
                if self.started && self.video.as_ref() != Some(&config) {
                    // Parameter change mid-publish re-announces the descriptors.
                    self.started = false;
                }
                self.video = Some(config);
                self.maybe_start(&mut events);
            }
            VideoTag::Frame {
                data,
                composition_offset_ms,
                is_keyframe,
            } => {
                if self.started {
                    events.push(DemuxEvent::Packet(MediaPacket::video(
                        data,
                        timestamp_ms,
                        composition_offset_ms,
                        is_keyframe,
                    )));
                } else {
                    self.skip("video");
                }
            }
            VideoTag::EndOfSequence => debug!("AVC end of sequence"),
            VideoTag::Ignored => trace!("Ignoring video command frame"),
        }
        Ok(events)
    }

    /// Feed one audio tag body.
    pub fn push_audio(&mut self, data: &Bytes, timestamp_ms: u32) -> IngestResult<Vec<DemuxEvent>> {
        let mut events = Vec::new();
        match parse_audio_tag(data)? {
            AudioTag::Config { channels } => {
                self.audio_channels = Some(channels);
                self.maybe_start(&mut events);
            }
            AudioTag::Frame { data, channels } => {
                if self.audio_channels.is_none() {
                    self.audio_channels = Some(channels.unwrap_or(2));
                }
                self.maybe_start(&mut events);
                if self.started {
                    events.push(DemuxEvent::Packet(MediaPacket::audio(data, timestamp_ms)));
                } else {
                    self.skip("audio");
                }
            }
            AudioTag::Ignored => {}
        }
        Ok(events)
    }

    fn maybe_start(&mut self, events: &mut Vec<DemuxEvent>) {
        if self.started {
            return;
        }
        let (Some(video), Some(channels)) = (&self.video, self.audio_channels) else {
            return;
        };
        self.started = true;
        events.push(DemuxEvent::Started(PublishDescriptors {
            audio: CodecDescriptor::Opus {
                sample_rate: OPUS_SAMPLE_RATE,
                channels,
            },
            video: CodecDescriptor::H264(video.clone()),
        }));
    }

    fn skip(&mut self, kind: &str) {
        self.skipped += 1;
        trace!(kind, skipped = self.skipped, "Dropping packet received before publish start");
    }
}
