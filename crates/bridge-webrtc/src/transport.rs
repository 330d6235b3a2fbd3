//! Negotiated transports and their outgoing streams.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::capabilities::Capabilities;
use crate::error::WebRtcError;
use crate::pump::SampleSink;
use crate::WebRtcResult;

/// Which side produced the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    /// We offered; the remote answered (gateway publish).
    OutboundInitiated,

    /// The remote offered; we answered (direct viewer).
    InboundInitiated,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutboundInitiated => f.write_str("outbound"),
            Self::InboundInitiated => f.write_str("inbound"),
        }
    }
}

/// One audio and one video track delivered over a transport.
#[derive(Clone)]
pub struct OutgoingStream {
    id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
}

impl OutgoingStream {
    /// Random stream identifier, also the media stream id in SDP.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_sink(&self) -> Arc<dyn SampleSink> {
        self.audio.clone()
    }

    pub fn video_sink(&self) -> Arc<dyn SampleSink> {
        self.video.clone()
    }
}

impl fmt::Debug for OutgoingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingStream").field("id", &self.id).finish()
    }
}

/// A peer connection with its media slots reserved.
///
/// The tracks are added to the peer connection when the transport is built
/// so they appear in the first description, but the [`OutgoingStream`] is
/// only handed out once both descriptions are applied.
pub struct Transport {
    id: String,
    direction: TransportDirection,
    peer: Arc<RTCPeerConnection>,
    stream: OutgoingStream,
    senders: Vec<Arc<RTCRtpSender>>,
    stream_created: AtomicBool,
    state: Arc<RwLock<RTCPeerConnectionState>>,
    closed: CancellationToken,
}

impl Transport {
    pub(crate) async fn new(
        peer: Arc<RTCPeerConnection>,
        capabilities: &Capabilities,
        direction: TransportDirection,
    ) -> WebRtcResult<Self> {
        let id = Uuid::new_v4().simple().to_string();
        let stream_id = Uuid::new_v4().to_string();

        let audio = Arc::new(TrackLocalStaticSample::new(
            capabilities.audio.track_codec()?,
            "audio".to_string(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            capabilities.video.track_codec()?,
            "video".to_string(),
            stream_id.clone(),
        ));

        let mut senders = Vec::with_capacity(2);
        for track in [audio.clone(), video.clone()] {
            let sender = peer
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            senders.push(sender);
        }

        let state = Arc::new(RwLock::new(RTCPeerConnectionState::New));
        let closed = CancellationToken::new();
        {
            let state = state.clone();
            let closed = closed.clone();
            let transport_id = id.clone();
            peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                *state.write() = s;
                info!(transport = %transport_id, state = %s, "Peer connection state changed");
                if matches!(
                    s,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    closed.cancel();
                }
                Box::pin(async {})
            }));
        }

        debug!(transport = %id, %direction, stream = %stream_id, "Transport created");

        Ok(Self {
            id,
            direction,
            peer,
            stream: OutgoingStream {
                id: stream_id,
                audio,
                video,
            },
            senders,
            stream_created: AtomicBool::new(false),
            state,
            closed,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    /// Last reported peer connection state.
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        *self.state.read()
    }

    /// Cancelled once the peer connection fails or closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether both local and remote descriptions are applied.
    pub async fn is_bound(&self) -> bool {
        self.peer.local_description().await.is_some()
            && self.peer.remote_description().await.is_some()
    }

    /// Hand out the outgoing stream. Fails unless the transport is bound,
    /// and only succeeds once per transport.
    pub async fn create_outgoing_stream(&self) -> WebRtcResult<OutgoingStream> {
        if !self.is_bound().await {
            return Err(WebRtcError::TransportNotBound);
        }
        if self.stream_created.swap(true, Ordering::SeqCst) {
            return Err(WebRtcError::StreamAlreadyCreated(self.id.clone()));
        }
        info!(transport = %self.id, stream = %self.stream.id, "Outgoing stream created");
        Ok(self.stream.clone())
    }

    pub(crate) fn senders(&self) -> &[Arc<RTCRtpSender>] {
        &self.senders
    }

    pub(crate) fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    /// Close the peer connection.
    pub async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            warn!(transport = %self.id, error = %e, "Failed to close peer connection");
        }
        self.closed.cancel();
        debug!(transport = %self.id, "Transport closed");
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.connection_state())
            .finish()
    }
}
