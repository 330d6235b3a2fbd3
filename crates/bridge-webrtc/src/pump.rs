//! Sample pumps.
//!
//! A pump reads one [`TrackSubscription`] and writes WebRTC samples to one
//! [`SampleSink`]. Shaping (timestamps to durations, AVCC to Annex B,
//! keyframe gating) is synchronous and lives in the shapers so it can be
//! tested without a peer connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_media::h264::{self, AvcDecoderConfig};
use bridge_media::{CodecDescriptor, MediaPacket, TrackEvent, TrackSubscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::WebRtcError;
use crate::WebRtcResult;

/// Duration of the first audio sample, before a timestamp delta exists.
pub const DEFAULT_AUDIO_FRAME_MS: u32 = 20;

/// Duration of the first video sample.
pub const DEFAULT_VIDEO_FRAME_MS: u32 = 33;

/// Deltas above this are treated as a discontinuity.
const MAX_SAMPLE_GAP_MS: u32 = 1000;

/// Destination of shaped samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, sample: &Sample) -> WebRtcResult<()>;
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write_sample(&self, sample: &Sample) -> WebRtcResult<()> {
        TrackLocalStaticSample::write_sample(self, sample)
            .await
            .map_err(|e| WebRtcError::Write(e.to_string()))
    }
}

/// Counters for one pump.
#[derive(Debug, Default)]
pub(crate) struct PumpStatistics {
    pub(crate) samples: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) errors: AtomicU64,
}

/// What a shaper made of one event.
#[derive(Debug)]
pub(crate) enum Shaped {
    Sample(Sample),
    /// A packet was discarded (no config yet, waiting for a keyframe).
    Skipped,
    /// The event carried no media.
    Nothing,
}

pub(crate) trait Shaper: Send {
    fn shape(&mut self, event: TrackEvent) -> Shaped;
}

fn sample_duration(previous: Option<u32>, current: u32, default_ms: u32) -> Duration {
    let ms = match previous {
        Some(prev) => match current.checked_sub(prev) {
            Some(delta) if delta > 0 && delta <= MAX_SAMPLE_GAP_MS => delta,
            _ => default_ms,
        },
        None => default_ms,
    };
    Duration::from_millis(ms as u64)
}

/// Opus packets pass through unchanged.
#[derive(Debug, Default)]
pub(crate) struct AudioShaper {
    configured: bool,
    last_timestamp: Option<u32>,
}

impl Shaper for AudioShaper {
    fn shape(&mut self, event: TrackEvent) -> Shaped {
        match event {
            TrackEvent::Configured(CodecDescriptor::Opus { .. }) => {
                self.configured = true;
                self.last_timestamp = None;
                Shaped::Nothing
            }
            TrackEvent::Configured(_) => Shaped::Nothing,
            TrackEvent::Ended => {
                self.configured = false;
                self.last_timestamp = None;
                Shaped::Nothing
            }
            TrackEvent::Packet(packet) => {
                if !self.configured {
                    return Shaped::Skipped;
                }
                let duration = sample_duration(
                    self.last_timestamp,
                    packet.timestamp_ms,
                    DEFAULT_AUDIO_FRAME_MS,
                );
                self.last_timestamp = Some(packet.timestamp_ms);
                Shaped::Sample(Sample {
                    data: packet.data,
                    duration,
                    ..Default::default()
                })
            }
        }
    }
}

/// H.264 access units become Annex B samples, gated on keyframes.
#[derive(Debug, Default)]
pub(crate) struct VideoShaper {
    config: Option<AvcDecoderConfig>,
    waiting_for_keyframe: bool,
    last_timestamp: Option<u32>,
    last_sequence: Option<u64>,
}

impl VideoShaper {
    fn reset(&mut self, config: Option<AvcDecoderConfig>) {
        self.config = config;
        self.waiting_for_keyframe = true;
        self.last_timestamp = None;
        self.last_sequence = None;
    }

    fn shape_packet(&mut self, packet: MediaPacket) -> Shaped {
        let Some(config) = &self.config else {
            return Shaped::Skipped;
        };

        // A gap means the sink dropped packets; references may be missing.
        if let Some(last) = self.last_sequence {
            if packet.sequence != last + 1 && !self.waiting_for_keyframe {
                debug!(
                    expected = last + 1,
                    got = packet.sequence,
                    "Video sequence gap, waiting for keyframe"
                );
                self.waiting_for_keyframe = true;
            }
        }
        self.last_sequence = Some(packet.sequence);

        let (data, keyframe) = match h264::access_unit_to_annex_b(&packet.data, config) {
            Ok(converted) => converted,
            Err(e) => {
                warn!(sequence = packet.sequence, error = %e, "Dropping malformed access unit");
                return Shaped::Skipped;
            }
        };

        if self.waiting_for_keyframe {
            if !keyframe {
                return Shaped::Skipped;
            }
            self.waiting_for_keyframe = false;
        }

        let duration = sample_duration(
            self.last_timestamp,
            packet.timestamp_ms,
            DEFAULT_VIDEO_FRAME_MS,
        );
        self.last_timestamp = Some(packet.timestamp_ms);

        Shaped::Sample(Sample {
            data,
            duration,
            ..Default::default()
        })
    }
}

impl Shaper for VideoShaper {
    fn shape(&mut self, event: TrackEvent) -> Shaped {
        match event {
            TrackEvent::Configured(CodecDescriptor::H264(config)) => {
                self.reset(Some(config));
                Shaped::Nothing
            }
            TrackEvent::Configured(_) => Shaped::Nothing,
            TrackEvent::Ended => {
                self.reset(None);
                Shaped::Nothing
            }
            TrackEvent::Packet(packet) => self.shape_packet(packet),
        }
    }
}

/// Move events from a subscription into a sink until cancelled or the
/// subscription closes.
pub(crate) async fn run_pump<S: Shaper>(
    mut subscription: TrackSubscription,
    mut shaper: S,
    sink: Arc<dyn SampleSink>,
    stats: Arc<PumpStatistics>,
    cancel: CancellationToken,
) {
    let kind = subscription.kind();
    let sink_id = subscription.id();
    debug!(%kind, sink = %sink_id, "Pump started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match shaper.shape(event) {
            Shaped::Sample(sample) => {
                let len = sample.data.len() as u64;
                match sink.write_sample(&sample).await {
                    Ok(()) => {
                        stats.samples.fetch_add(1, Ordering::Relaxed);
                        stats.bytes.fetch_add(len, Ordering::Relaxed);
                        trace!(%kind, len, "Sample written");
                    }
                    Err(e) => {
                        let errors = stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
                        if errors.is_power_of_two() {
                            warn!(%kind, sink = %sink_id, errors, error = %e, "Sample write failed");
                        }
                    }
                }
            }
            Shaped::Skipped => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Shaped::Nothing => {}
        }
    }

    debug!(%kind, sink = %sink_id, "Pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_media::{IngestTrack, MediaKind};
    use bytes::Bytes;
    use parking_lot::Mutex;

    const SPS: [u8; 6] = [0x67, 0x42, 0xE0, 0x1F, 0xAB, 0xCD];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn config() -> AvcDecoderConfig {
        AvcDecoderConfig {
            profile_idc: 0x42,
            profile_compatibility: 0xE0,
            level_idc: 0x1F,
            nal_length_size: 4,
            sps: vec![Bytes::from_static(&SPS)],
            pps: vec![Bytes::from_static(&PPS)],
        }
    }

    /// One length-prefixed NAL unit.
    fn access_unit(nal: &[u8]) -> Bytes {
        let mut out = (nal.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(nal);
        Bytes::from(out)
    }

    fn video_packet(nal: &[u8], ts: u32, sequence: u64) -> TrackEvent {
        let mut packet = MediaPacket::video(access_unit(nal), ts, 0, nal[0] & 0x1F == 5);
        packet.sequence = sequence;
        TrackEvent::Packet(packet)
    }

    #[derive(Default)]
    struct RecordingSink {
        samples: Mutex<Vec<Sample>>,
    }

    #[async_trait]
    impl SampleSink for RecordingSink {
        async fn write_sample(&self, sample: &Sample) -> WebRtcResult<()> {
            self.samples.lock().push(Sample {
                data: sample.data.clone(),
                timestamp: sample.timestamp,
                duration: sample.duration,
                packet_timestamp: sample.packet_timestamp,
                prev_dropped_packets: sample.prev_dropped_packets,
                prev_padding_packets: sample.prev_padding_packets,
            });
            Ok(())
        }
    }

    #[test]
    fn test_sample_duration() {
        assert_eq!(sample_duration(None, 100, 20), Duration::from_millis(20));
        assert_eq!(sample_duration(Some(100), 121, 20), Duration::from_millis(21));
        assert_eq!(sample_duration(Some(100), 100, 20), Duration::from_millis(20));
        assert_eq!(sample_duration(Some(100), 50, 20), Duration::from_millis(20));
        assert_eq!(sample_duration(Some(0), 5000, 20), Duration::from_millis(20));
    }

    #[test]
    fn test_audio_requires_configuration() {
        let mut shaper = AudioShaper::default();
        let packet = TrackEvent::Packet(MediaPacket::audio(Bytes::from_static(b"op"), 0));
        assert!(matches!(shaper.shape(packet.clone()), Shaped::Skipped));

        shaper.shape(TrackEvent::Configured(CodecDescriptor::Opus {
            sample_rate: 48000,
            channels: 2,
        }));
        match shaper.shape(packet) {
            Shaped::Sample(sample) => {
                assert_eq!(sample.data, Bytes::from_static(b"op"));
                assert_eq!(sample.duration, Duration::from_millis(20));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_video_waits_for_keyframe() {
        let mut shaper = VideoShaper::default();
        shaper.shape(TrackEvent::Configured(CodecDescriptor::H264(config())));

        assert!(matches!(
            shaper.shape(video_packet(&[0x41, 0x9A], 0, 0)),
            Shaped::Skipped
        ));

        match shaper.shape(video_packet(&[0x65, 0x88], 33, 1)) {
            Shaped::Sample(sample) => {
                // SPS, PPS, then the IDR slice.
                let mut expected = vec![0, 0, 0, 1];
                expected.extend_from_slice(&SPS);
                expected.extend_from_slice(&[0, 0, 0, 1]);
                expected.extend_from_slice(&PPS);
                expected.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);
                assert_eq!(sample.data.as_ref(), expected.as_slice());
            }
            other => panic!("unexpected: {:?}", other),
        }

        match shaper.shape(video_packet(&[0x41, 0x9A], 66, 2)) {
            Shaped::Sample(sample) => {
                assert_eq!(sample.data.as_ref(), &[0, 0, 0, 1, 0x41, 0x9A]);
                assert_eq!(sample.duration, Duration::from_millis(33));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_video_gap_regates() {
        let mut shaper = VideoShaper::default();
        shaper.shape(TrackEvent::Configured(CodecDescriptor::H264(config())));
        assert!(matches!(
            shaper.shape(video_packet(&[0x65, 0x88], 0, 0)),
            Shaped::Sample(_)
        ));
        // Sequence 1 was lost.
        assert!(matches!(
            shaper.shape(video_packet(&[0x41, 0x9A], 66, 2)),
            Shaped::Skipped
        ));
        assert!(matches!(
            shaper.shape(video_packet(&[0x65, 0x88], 99, 3)),
            Shaped::Sample(_)
        ));
    }

    #[test]
    fn test_video_ended_clears_config() {
        let mut shaper = VideoShaper::default();
        shaper.shape(TrackEvent::Configured(CodecDescriptor::H264(config())));
        shaper.shape(TrackEvent::Ended);
        assert!(matches!(
            shaper.shape(video_packet(&[0x65, 0x88], 0, 0)),
            Shaped::Skipped
        ));
    }

    #[tokio::test]
    async fn test_pump_writes_to_sink() {
        let track = IngestTrack::new(MediaKind::Audio);
        track
            .configure(CodecDescriptor::Opus {
                sample_rate: 48000,
                channels: 2,
            })
            .unwrap();
        let subscription = track.attach();

        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(PumpStatistics::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pump(
            subscription,
            AudioShaper::default(),
            sink.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        for ts in [0u32, 20, 40] {
            track
                .write(MediaPacket::audio(Bytes::from_static(b"opus"), ts))
                .unwrap();
        }

        for _ in 0..100 {
            if stats.samples.load(Ordering::Relaxed) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sink.samples.lock().len(), 3);
        assert_eq!(stats.bytes.load(Ordering::Relaxed), 12);
    }
}
