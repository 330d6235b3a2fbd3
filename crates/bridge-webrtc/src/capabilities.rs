//! Advertised codec capabilities.
//!
//! The set is fixed: Opus audio and H.264 video with RTX, the usual
//! congestion and loss feedback, and three video header extensions. The
//! same set is registered with the media engine and used to check remote
//! descriptions, so what is offered is exactly what is verified.

use std::fmt;

use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::WebRtcError;
use crate::sdp::{MediaSummary, SdpSummary};
use crate::{WebRtcResult, AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE, VIDEO_RTX_PAYLOAD_TYPE};

/// fmtp line advertised for H.264: constrained baseline 3.1, non-interleaved.
pub const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// fmtp line advertised for Opus.
pub const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// An RTCP feedback mechanism, e.g. `nack pli`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub kind: String,
    pub parameter: String,
}

impl Feedback {
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }

    fn to_rtcp(&self) -> RTCPFeedback {
        RTCPFeedback {
            typ: self.kind.clone(),
            parameter: self.parameter.clone(),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parameter.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{} {}", self.kind, self.parameter)
        }
    }
}

/// One codec entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: String,
}

impl CodecCapability {
    /// Encoding name as written in `rtpmap`, e.g. `H264`.
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }
}

/// Capabilities for one media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub codecs: Vec<CodecCapability>,
    /// Advertise an RTX stream for the first codec.
    pub rtx: bool,
    pub rtcp_feedback: Vec<Feedback>,
    pub extensions: Vec<String>,
}

impl Capability {
    /// The codec media is sent with.
    pub fn primary(&self) -> Option<&CodecCapability> {
        self.codecs.first()
    }

    /// Codec capability for a local track of this kind.
    pub fn track_codec(&self) -> WebRtcResult<RTCRtpCodecCapability> {
        let codec = self
            .primary()
            .ok_or_else(|| WebRtcError::Config("no codec configured".to_string()))?;
        Ok(RTCRtpCodecCapability {
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            sdp_fmtp_line: codec.fmtp.clone(),
            rtcp_feedback: self.rtcp_feedback.iter().map(Feedback::to_rtcp).collect(),
        })
    }

    fn register(&self, engine: &mut MediaEngine, kind: RTPCodecType) -> WebRtcResult<()> {
        let feedback: Vec<RTCPFeedback> = self.rtcp_feedback.iter().map(Feedback::to_rtcp).collect();

        for codec in &self.codecs {
            engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: codec.mime_type.clone(),
                        clock_rate: codec.clock_rate,
                        channels: codec.channels,
                        sdp_fmtp_line: codec.fmtp.clone(),
                        rtcp_feedback: feedback.clone(),
                    },
                    payload_type: codec.payload_type,
                    ..Default::default()
                },
                kind,
            )?;
        }

        if self.rtx {
            if let Some(primary) = self.primary() {
                engine.register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: "video/rtx".to_string(),
                            clock_rate: primary.clock_rate,
                            channels: 0,
                            sdp_fmtp_line: format!("apt={}", primary.payload_type),
                            rtcp_feedback: vec![],
                        },
                        payload_type: VIDEO_RTX_PAYLOAD_TYPE,
                        ..Default::default()
                    },
                    kind,
                )?;
            }
        }

        for uri in &self.extensions {
            engine.register_header_extension(
                RTCRtpHeaderExtensionCapability { uri: uri.clone() },
                kind,
                None,
            )?;
        }
        Ok(())
    }

    /// Check a remote media section against this capability.
    fn verify(&self, kind: &str, section: Option<&MediaSummary>) -> WebRtcResult<()> {
        let section = section.ok_or_else(|| {
            WebRtcError::NegotiationFailed(format!("remote description has no {} section", kind))
        })?;
        if section.is_rejected() {
            return Err(WebRtcError::NegotiationFailed(format!(
                "remote rejected the {} section",
                kind
            )));
        }

        let primary = self
            .primary()
            .ok_or_else(|| WebRtcError::Config(format!("no {} codec configured", kind)))?;
        let name = primary.encoding_name();
        let remote = section.codec(name).ok_or_else(|| {
            WebRtcError::NegotiationFailed(format!(
                "remote {} section does not accept {}",
                kind, name
            ))
        })?;
        if remote.clock_rate != primary.clock_rate {
            return Err(WebRtcError::NegotiationFailed(format!(
                "remote {} clock rate {} differs from {}",
                name, remote.clock_rate, primary.clock_rate
            )));
        }
        if primary.mime_type == MIME_TYPE_H264 {
            let fmtp = remote.fmtp.as_deref().unwrap_or_default();
            if fmtp.contains("packetization-mode=0") {
                return Err(WebRtcError::NegotiationFailed(
                    "remote requires H264 packetization-mode=0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Audio and video capabilities advertised by every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub audio: Capability,
    pub video: Capability,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            audio: Capability {
                codecs: vec![CodecCapability {
                    payload_type: AUDIO_PAYLOAD_TYPE,
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    fmtp: OPUS_FMTP.to_string(),
                }],
                rtx: false,
                rtcp_feedback: vec![],
                extensions: vec![],
            },
            video: Capability {
                codecs: vec![CodecCapability {
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    fmtp: H264_FMTP.to_string(),
                }],
                rtx: true,
                rtcp_feedback: vec![
                    Feedback::new("goog-remb", ""),
                    Feedback::new("transport-cc", ""),
                    Feedback::new("ccm", "fir"),
                    Feedback::new("nack", ""),
                    Feedback::new("nack", "pli"),
                ],
                extensions: vec![
                    "urn:3gpp:video-orientation".to_string(),
                    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
                        .to_string(),
                    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
                ],
            },
        }
    }
}

impl Capabilities {
    /// A media engine with exactly these capabilities registered.
    pub fn media_engine(&self) -> WebRtcResult<MediaEngine> {
        let mut engine = MediaEngine::default();
        self.audio.register(&mut engine, RTPCodecType::Audio)?;
        self.video.register(&mut engine, RTPCodecType::Video)?;
        Ok(engine)
    }

    /// Fail unless the remote description accepts our audio and video
    /// codecs.
    pub fn verify_remote(&self, remote: &SdpSummary) -> WebRtcResult<()> {
        self.audio.verify("audio", remote.section("audio"))?;
        self.video.verify("video", remote.section("video"))?;
        Ok(())
    }

    /// Feedback strings as they appear after the payload type in SDP.
    pub fn video_feedback_lines(&self) -> Vec<String> {
        self.video.rtcp_feedback.iter().map(|f| f.to_string()).collect()
    }
}
