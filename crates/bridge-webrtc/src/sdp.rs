//! Read-only SDP summaries.
//!
//! Only what capability checks need: per media section, its kind, the
//! codecs with their feedback, and the header extensions.

use std::io::Cursor;

use webrtc::sdp::description::session::SessionDescription;

use crate::error::WebRtcError;
use crate::WebRtcResult;

/// One `a=rtpmap` entry with its `fmtp` and `rtcp-fb` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtp: Option<String>,
    /// Feedback lines without the payload type, e.g. `nack pli`.
    pub feedback: Vec<String>,
}

impl SdpCodec {
    /// Whether this is a retransmission codec.
    pub fn is_rtx(&self) -> bool {
        self.name.eq_ignore_ascii_case("rtx")
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSummary {
    /// `audio`, `video` or `application`.
    pub kind: String,
    /// Port zero marks a rejected section.
    pub port: u16,
    pub codecs: Vec<SdpCodec>,
    /// Header extension URIs.
    pub extensions: Vec<String>,
}

impl MediaSummary {
    /// First codec with this name, case-insensitive.
    pub fn codec(&self, name: &str) -> Option<&SdpCodec> {
        self.codecs.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }
}

/// Summary of a whole session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSummary {
    pub media: Vec<MediaSummary>,
}

impl SdpSummary {
    /// Parse an SDP string.
    pub fn parse(sdp: &str) -> WebRtcResult<Self> {
        let mut reader = Cursor::new(sdp.as_bytes());
        let description = SessionDescription::unmarshal(&mut reader)
            .map_err(|e| WebRtcError::Sdp(e.to_string()))?;

        let media = description
            .media_descriptions
            .iter()
            .map(|md| {
                let mut codecs: Vec<SdpCodec> = Vec::new();
                let mut extensions = Vec::new();
                let mut fmtps = Vec::new();
                let mut feedback = Vec::new();

                for attr in &md.attributes {
                    let value = attr.value.as_deref().unwrap_or_default();
                    match attr.key.as_str() {
                        "rtpmap" => {
                            if let Some(codec) = parse_rtpmap(value) {
                                codecs.push(codec);
                            }
                        }
                        "fmtp" => {
                            if let Some((pt, rest)) = split_payload_type(value) {
                                fmtps.push((pt, rest.to_string()));
                            }
                        }
                        "rtcp-fb" => {
                            if let Some((pt, rest)) = split_payload_type(value) {
                                feedback.push((pt, rest.to_string()));
                            }
                        }
                        "extmap" => {
                            if let Some(uri) = value.split_whitespace().nth(1) {
                                extensions.push(uri.to_string());
                            }
                        }
                        _ => {}
                    }
                }

                for codec in codecs.iter_mut() {
                    codec.fmtp = fmtps
                        .iter()
                        .find(|(pt, _)| *pt == codec.payload_type)
                        .map(|(_, f)| f.clone());
                    codec.feedback = feedback
                        .iter()
                        .filter(|(pt, _)| *pt == codec.payload_type)
                        .map(|(_, f)| f.clone())
                        .collect();
                }

                MediaSummary {
                    kind: md.media_name.media.clone(),
                    port: md.media_name.port.value.clamp(0, u16::MAX as isize) as u16,
                    codecs,
                    extensions,
                }
            })
            .collect();

        Ok(Self { media })
    }

    /// First media section of a kind.
    pub fn section(&self, kind: &str) -> Option<&MediaSummary> {
        self.media.iter().find(|m| m.kind == kind)
    }
}

/// `96 opus/48000/2` → codec entry.
fn parse_rtpmap(value: &str) -> Option<SdpCodec> {
    let (pt, encoding) = split_payload_type(value)?;
    let mut parts = encoding.split('/');
    let name = parts.next()?.to_string();
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());

    Some(SdpCodec {
        payload_type: pt,
        name,
        clock_rate,
        channels,
        fmtp: None,
        feedback: Vec::new(),
    })
}

fn split_payload_type(value: &str) -> Option<(u8, &str)> {
    let (pt, rest) = value.split_once(' ')?;
    Some((pt.parse().ok()?, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtcp-fb:111 transport-cc\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102 103\r\n\
c=IN IP4 0.0.0.0\r\n\
a=extmap:3 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtcp-fb:102 goog-remb\r\n\
a=rtcp-fb:102 nack\r\n\
a=rtcp-fb:102 nack pli\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtpmap:103 rtx/90000\r\n\
a=fmtp:103 apt=102\r\n\
m=application 0 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n";

    #[test]
    fn test_parse_summary() {
        let summary = SdpSummary::parse(OFFER).unwrap();
        assert_eq!(summary.media.len(), 3);

        let audio = summary.section("audio").unwrap();
        let opus = audio.codec("opus").unwrap();
        assert_eq!(opus.payload_type, 111);
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));
        assert_eq!(opus.feedback, vec!["transport-cc".to_string()]);

        let video = summary.section("video").unwrap();
        let h264 = video.codec("h264").unwrap();
        assert_eq!(h264.feedback, vec!["goog-remb", "nack", "nack pli"]);
        assert!(h264.fmtp.as_deref().unwrap().contains("packetization-mode=1"));
        assert!(video.codecs[1].is_rtx());
        assert_eq!(
            video.extensions,
            vec!["http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time"]
        );

        assert!(summary.section("application").unwrap().is_rejected());
    }

    #[test]
    fn test_garbage_is_sdp_error() {
        assert!(matches!(
            SdpSummary::parse("hello"),
            Err(WebRtcError::Sdp(_))
        ));
    }
}
