//! Shared ingest tracks.
//!
//! An [`IngestTrack`] is written by the RTMP ingest side and read by any
//! number of sinks. Each sink owns a bounded channel; delivery uses
//! `try_send` so a slow sink loses packets instead of stalling the writer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::error::MediaError;
use crate::packet::{CodecDescriptor, MediaKind, MediaPacket};
use crate::{MediaResult, SINK_CHANNEL_CAPACITY};

/// Events delivered to a sink, in ingest order.
#[derive(Debug, Clone)]
pub enum TrackEvent {
    /// A publish started (or was live when the sink attached).
    Configured(CodecDescriptor),

    /// One codec packet.
    Packet(MediaPacket),

    /// The publish ended.
    Ended,
}

/// Identifier of an attached sink, unique per track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Per-sink delivery counters.
#[derive(Debug, Default)]
pub struct SinkStatistics {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SinkStatistics {
    /// Read the current counters.
    pub fn snapshot(&self) -> SinkStatisticsSnapshot {
        SinkStatisticsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SinkStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatisticsSnapshot {
    /// Events enqueued to the sink.
    pub delivered: u64,

    /// Events dropped because the sink channel was full.
    pub dropped: u64,
}

/// Point-in-time counters for a whole track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStatistics {
    pub packets_written: u64,
    pub bytes_written: u64,
    pub sinks: usize,
}

/// The receiving half handed to a sink on attach.
pub struct TrackSubscription {
    id: SinkId,
    kind: MediaKind,
    receiver: mpsc::Receiver<TrackEvent>,
    stats: Arc<SinkStatistics>,
}

impl TrackSubscription {
    /// This sink's identifier on its track.
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Kind of the track this subscription belongs to.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Delivery counters for this sink.
    pub fn stats(&self) -> Arc<SinkStatistics> {
        self.stats.clone()
    }

    /// Wait for the next event. Returns `None` once the sink is detached
    /// and its buffered events are drained.
    pub async fn recv(&mut self) -> Option<TrackEvent> {
        self.receiver.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<TrackEvent> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for TrackSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackSubscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Sink {
    id: SinkId,
    sender: mpsc::Sender<TrackEvent>,
    stats: Arc<SinkStatistics>,
}

impl Sink {
    /// Enqueue without blocking. Returns false if the sink is gone.
    fn offer(&self, event: TrackEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(sink = %self.id, dropped, "Sink is not keeping up, dropping events");
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct TrackState {
    sinks: Vec<Sink>,
    descriptor: Option<CodecDescriptor>,
    next_sequence: u64,
}

/// A long-lived media source shared by every viewer.
///
/// The sink set and the current codec descriptor live behind one lock so a
/// sink attaching mid-publish observes the descriptor and then exactly the
/// packets written after it, with nothing missed or duplicated.
pub struct IngestTrack {
    kind: MediaKind,
    state: Mutex<TrackState>,
    next_sink_id: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl IngestTrack {
    /// Create an empty track of the given kind.
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            state: Mutex::new(TrackState {
                sinks: Vec::new(),
                descriptor: None,
                next_sequence: 0,
            }),
            next_sink_id: AtomicU64::new(1),
            packets_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// The kind of media carried by this track.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether a publish is currently feeding this track.
    pub fn is_live(&self) -> bool {
        self.state.lock().descriptor.is_some()
    }

    /// Codec parameters of the live publish, if any.
    pub fn descriptor(&self) -> Option<CodecDescriptor> {
        self.state.lock().descriptor.clone()
    }

    /// Record the codec parameters of a new publish and announce them to
    /// every attached sink.
    pub fn configure(&self, descriptor: CodecDescriptor) -> MediaResult<()> {
        if descriptor.kind() != self.kind {
            return Err(MediaError::KindMismatch {
                track: self.kind,
                packet: descriptor.kind(),
            });
        }

        info!(kind = %self.kind, codec = %descriptor.codec(), "Ingest track configured");

        let mut state = self.state.lock();
        state.descriptor = Some(descriptor.clone());
        Self::broadcast(&mut state, || TrackEvent::Configured(descriptor.clone()));
        Ok(())
    }

    /// Append a packet and fan it out to every sink.
    ///
    /// Never blocks on a sink. Returns the sequence number assigned to the
    /// packet.
    pub fn write(&self, mut packet: MediaPacket) -> MediaResult<u64> {
        if packet.kind != self.kind {
            return Err(MediaError::KindMismatch {
                track: self.kind,
                packet: packet.kind,
            });
        }

        let len = packet.data.len() as u64;
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        packet.sequence = sequence;

        trace!(kind = %self.kind, sequence, ts = packet.timestamp_ms, len, "Ingest packet");
        Self::broadcast(&mut state, || TrackEvent::Packet(packet.clone()));
        drop(state);

        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(sequence)
    }

    /// Mark the publish as finished. Sinks stay attached for the next one.
    pub fn end(&self) {
        let mut state = self.state.lock();
        if state.descriptor.take().is_some() {
            info!(kind = %self.kind, "Ingest track ended");
            Self::broadcast(&mut state, || TrackEvent::Ended);
        }
    }

    /// Attach a new sink.
    ///
    /// If a publish is live the subscription starts with a
    /// [`TrackEvent::Configured`] carrying its codec parameters.
    pub fn attach(&self) -> TrackSubscription {
        let id = SinkId(self.next_sink_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let stats = Arc::new(SinkStatistics::default());
        let sink = Sink {
            id,
            sender,
            stats: stats.clone(),
        };

        let mut state = self.state.lock();
        if let Some(descriptor) = &state.descriptor {
            sink.offer(TrackEvent::Configured(descriptor.clone()));
        }
        state.sinks.push(sink);
        let sinks = state.sinks.len();
        drop(state);

        debug!(kind = %self.kind, sink = %id, sinks, "Sink attached");

        TrackSubscription {
            id,
            kind: self.kind,
            receiver,
            stats,
        }
    }

    /// Remove a sink. Returns false if it was not attached.
    pub fn detach(&self, id: SinkId) -> bool {
        let mut state = self.state.lock();
        let before = state.sinks.len();
        state.sinks.retain(|s| s.id != id);
        let removed = state.sinks.len() != before;
        let sinks = state.sinks.len();
        drop(state);

        if removed {
            debug!(kind = %self.kind, sink = %id, sinks, "Sink detached");
        }
        removed
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.state.lock().sinks.len()
    }

    /// Current counters.
    pub fn stats(&self) -> TrackStatistics {
        TrackStatistics {
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            sinks: self.sink_count(),
        }
    }

    fn broadcast(state: &mut TrackState, event: impl Fn() -> TrackEvent) {
        state.sinks.retain(|sink| {
            let open = sink.offer(event());
            if !open {
                debug!(sink = %sink.id, "Pruning closed sink");
            }
            open
        });
    }
}

impl fmt::Debug for IngestTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestTrack")
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .field("sinks", &self.sink_count())
            .finish()
    }
}
