//! Media relay from the shared ingest tracks to outgoing streams.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bridge_media::{IngestTrack, SinkId, SinkStatistics, SinkStatisticsSnapshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::pump::{run_pump, AudioShaper, PumpStatistics, VideoShaper};
use crate::transport::Transport;
use crate::WebRtcResult;

const RTCP_BUFFER_SIZE: usize = 1500;

/// Attaches transports to the audio and video ingest tracks.
#[derive(Debug, Clone)]
pub struct MediaRelay {
    audio: Arc<IngestTrack>,
    video: Arc<IngestTrack>,
    active: Arc<AtomicUsize>,
}

impl MediaRelay {
    pub fn new(audio: Arc<IngestTrack>, video: Arc<IngestTrack>) -> Self {
        Self {
            audio,
            video,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live attachments.
    pub fn active_attachments(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Create the transport's outgoing stream and feed it from the ingest
    /// tracks. Media flows until the attachment is dropped or the
    /// transport closes.
    #[instrument(name = "relay_attach", skip_all, fields(transport = %transport.id()))]
    pub async fn attach(&self, transport: &Transport) -> WebRtcResult<Attachment> {
        let stream = transport.create_outgoing_stream().await?;
        let cancel = transport.closed().child_token();
        let tasks = TaskTracker::new();

        let audio_sub = self.audio.attach();
        let video_sub = self.video.attach();
        let audio_sink = audio_sub.id();
        let video_sink = video_sub.id();
        let audio_delivery = audio_sub.stats();
        let video_delivery = video_sub.stats();

        let audio_pump = Arc::new(PumpStatistics::default());
        let video_pump = Arc::new(PumpStatistics::default());

        tasks.spawn(run_pump(
            audio_sub,
            AudioShaper::default(),
            stream.audio_sink(),
            audio_pump.clone(),
            cancel.clone(),
        ));
        tasks.spawn(run_pump(
            video_sub,
            VideoShaper::default(),
            stream.video_sink(),
            video_pump.clone(),
            cancel.clone(),
        ));
        for sender in transport.senders() {
            tasks.spawn(drain_rtcp(sender.clone(), cancel.clone()));
        }
        tasks.close();

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            transport = %transport.id(),
            stream = %stream.id(),
            %audio_sink,
            %video_sink,
            active,
            "Transport attached to relay"
        );

        Ok(Attachment {
            transport_id: transport.id().to_string(),
            stream_id: stream.id().to_string(),
            audio: self.audio.clone(),
            video: self.video.clone(),
            audio_sink,
            video_sink,
            audio_delivery,
            video_delivery,
            audio_pump,
            video_pump,
            cancel,
            tasks,
            active: self.active.clone(),
        })
    }
}

/// Read RTCP so the interceptors see receiver reports and NACKs.
async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sender.read(&mut buf) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
}

/// Counters for one attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentStatistics {
    pub audio_delivery: SinkStatisticsSnapshot,
    pub video_delivery: SinkStatisticsSnapshot,
    pub samples_written: u64,
    pub bytes_written: u64,
    /// Packets discarded before a keyframe or configuration.
    pub packets_skipped: u64,
    pub write_errors: u64,
}

/// One transport's link to the ingest tracks. Dropping it detaches both
/// sinks and stops the pumps.
pub struct Attachment {
    transport_id: String,
    stream_id: String,
    audio: Arc<IngestTrack>,
    video: Arc<IngestTrack>,
    audio_sink: SinkId,
    video_sink: SinkId,
    audio_delivery: Arc<SinkStatistics>,
    video_delivery: Arc<SinkStatistics>,
    audio_pump: Arc<PumpStatistics>,
    video_pump: Arc<PumpStatistics>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl Attachment {
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether the pumps are still running.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the transport closes or the attachment is stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn statistics(&self) -> AttachmentStatistics {
        let (audio, video) = (&self.audio_pump, &self.video_pump);
        AttachmentStatistics {
            audio_delivery: self.audio_delivery.snapshot(),
            video_delivery: self.video_delivery.snapshot(),
            samples_written: audio.samples.load(Ordering::Relaxed)
                + video.samples.load(Ordering::Relaxed),
            bytes_written: audio.bytes.load(Ordering::Relaxed)
                + video.bytes.load(Ordering::Relaxed),
            packets_skipped: audio.skipped.load(Ordering::Relaxed)
                + video.skipped.load(Ordering::Relaxed),
            write_errors: audio.errors.load(Ordering::Relaxed)
                + video.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the pumps and wait for them to exit.
    pub async fn detach(self) {
        self.cancel.cancel();
        self.tasks.wait().await;
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("transport", &self.transport_id)
            .field("stream", &self.stream_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.audio.detach(self.audio_sink);
        self.video.detach(self.video_sink);
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        debug!(
            transport = %self.transport_id,
            stream = %self.stream_id,
            active,
            "Transport detached from relay"
        );
    }
}
