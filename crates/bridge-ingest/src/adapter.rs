//! Publish slot and routing of demuxed packets onto the ingest tracks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use bridge_media::{CodecId, IngestTrack, MediaKind, MediaPacket, PublishDescriptors};

use crate::error::IngestError;
use crate::IngestResult;

/// Identifier of one accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublishId(u64);

impl PublishId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PublishId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publish-{}", self.0)
    }
}

/// Ingest counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStatistics {
    pub audio_packets: u64,
    pub video_packets: u64,
    pub audio_bytes: u64,
    pub video_bytes: u64,
    pub publishes_accepted: u64,
    pub publishes_rejected: u64,
}

#[derive(Default)]
struct Counters {
    audio_packets: AtomicU64,
    video_packets: AtomicU64,
    audio_bytes: AtomicU64,
    video_bytes: AtomicU64,
    publishes_accepted: AtomicU64,
    publishes_rejected: AtomicU64,
}

struct ActivePublish {
    id: PublishId,
    stream_key: String,
    started: bool,
    base_timestamp: Option<u32>,
}

/// Bridges one RTMP publish at a time onto the shared audio and video
/// tracks.
///
/// Forwarding only ever enqueues onto sink channels, so a slow viewer
/// cannot stall the publisher's read loop.
pub struct IngestAdapter {
    audio: Arc<IngestTrack>,
    video: Arc<IngestTrack>,
    required_key: Option<String>,
    active: Mutex<Option<ActivePublish>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl IngestAdapter {
    /// Create an adapter writing to the given tracks.
    ///
    /// With `required_key` set, publishes with any other stream key are
    /// refused.
    pub fn new(
        audio: Arc<IngestTrack>,
        video: Arc<IngestTrack>,
        required_key: Option<String>,
    ) -> Self {
        Self {
            audio,
            video,
            required_key,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Shared audio track.
    pub fn audio_track(&self) -> Arc<IngestTrack> {
        self.audio.clone()
    }

    /// Shared video track.
    pub fn video_track(&self) -> Arc<IngestTrack> {
        self.video.clone()
    }

    /// Take the publish slot for a new publisher.
    pub fn claim(&self, stream_key: &str) -> IngestResult<PublishId> {
        if let Some(required) = &self.required_key {
            if required != stream_key {
                self.counters
                    .publishes_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return Err(IngestError::PublishRejected(format!(
                    "unknown stream key '{}'",
                    stream_key
                )));
            }
        }

        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            self.counters
                .publishes_rejected
                .fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::PublishRejected(format!(
                "'{}' is already publishing",
                current.stream_key
            )));
        }

        let id = PublishId(self.next_id.fetch_add(1, Ordering::Relaxed));
        *active = Some(ActivePublish {
            id,
            stream_key: stream_key.to_string(),
            started: false,
            base_timestamp: None,
        });
        self.counters
            .publishes_accepted
            .fetch_add(1, Ordering::Relaxed);

        info!(publish = %id, stream_key, "Publish slot claimed");
        Ok(id)
    }

    /// Record the codec parameters of the publish and open both tracks.
    #[instrument(name = "publish_start", skip(self, descriptors), fields(publish = %id))]
    pub fn on_publish_start(&self, id: PublishId, descriptors: PublishDescriptors) -> IngestResult<()> {
        if descriptors.audio.codec() != CodecId::Opus {
            return Err(IngestError::CodecMismatch(format!(
                "audio codec {} is not opus",
                descriptors.audio.codec()
            )));
        }
        if descriptors.video.codec() != CodecId::H264 {
            return Err(IngestError::CodecMismatch(format!(
                "video codec {} is not H264",
                descriptors.video.codec()
            )));
        }

        let mut active = self.active.lock();
        let publish = match active.as_mut() {
            Some(p) if p.id == id => p,
            _ => return Err(IngestError::NotPublishing(id.as_u64())),
        };

        self.audio.configure(descriptors.audio)?;
        self.video.configure(descriptors.video)?;
        publish.started = true;

        info!(stream_key = %publish.stream_key, "Publish started");
        Ok(())
    }

    /// Forward one packet to its track.
    pub fn on_packet(&self, id: PublishId, mut packet: MediaPacket) -> IngestResult<()> {
        {
            let mut active = self.active.lock();
            let publish = match active.as_mut() {
                Some(p) if p.id == id && p.started => p,
                _ => return Err(IngestError::NotPublishing(id.as_u64())),
            };
            // One base for both kinds keeps them aligned. A packet stamped
            // before the base is clamped to it.
            let base = *publish.base_timestamp.get_or_insert(packet.timestamp_ms);
            packet.timestamp_ms = packet.timestamp_ms.saturating_sub(base);
        }

        let len = packet.data.len() as u64;
        match packet.kind {
            MediaKind::Audio => {
                self.audio.write(packet)?;
                self.counters.audio_packets.fetch_add(1, Ordering::Relaxed);
                self.counters.audio_bytes.fetch_add(len, Ordering::Relaxed);
            }
            MediaKind::Video => {
                self.video.write(packet)?;
                self.counters.video_packets.fetch_add(1, Ordering::Relaxed);
                self.counters.video_bytes.fetch_add(len, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Release the publish slot. Ends both tracks if the publish had started.
    pub fn on_publish_end(&self, id: PublishId) {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(p) if p.id == id => {}
            _ => {
                debug!(publish = %id, "Publish end for inactive publish ignored");
                return;
            }
        }

        if let Some(publish) = active.take() {
            if publish.started {
                self.audio.end();
                self.video.end();
            } else {
                warn!(publish = %id, "Publish ended before media started");
            }
            info!(publish = %id, stream_key = %publish.stream_key, "Publish ended");
        }
    }

    /// Whether a publish is currently feeding the tracks.
    pub fn is_live(&self) -> bool {
        self.active.lock().as_ref().map(|p| p.started).unwrap_or(false)
    }

    /// Stream key of the publish holding the slot.
    pub fn active_stream_key(&self) -> Option<String> {
        self.active.lock().as_ref().map(|p| p.stream_key.clone())
    }

    /// Current counters.
    pub fn statistics(&self) -> IngestStatistics {
        let c = &self.counters;
        IngestStatistics {
            audio_packets: c.audio_packets.load(Ordering::Relaxed),
            video_packets: c.video_packets.load(Ordering::Relaxed),
            audio_bytes: c.audio_bytes.load(Ordering::Relaxed),
            video_bytes: c.video_bytes.load(Ordering::Relaxed),
            publishes_accepted: c.publishes_accepted.load(Ordering::Relaxed),
            publishes_rejected: c.publishes_rejected.load(Ordering::Relaxed),
        }
    }
}
