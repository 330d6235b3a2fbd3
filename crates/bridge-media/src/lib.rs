//! Shared media types for the RTMP to WebRTC bridge.
//!
//! This crate defines the codec packets produced by RTMP ingestion, the
//! long-lived [`IngestTrack`] that fans those packets out to any number of
//! sinks, and the H.264 helpers needed to turn AVCC access units into the
//! Annex B samples expected by the WebRTC packetizer.

mod error;
pub mod h264;
mod packet;
mod track;

pub use error::MediaError;
pub use packet::{CodecDescriptor, CodecId, MediaKind, MediaPacket, PublishDescriptors};
pub use track::{
    IngestTrack, SinkId, SinkStatistics, SinkStatisticsSnapshot, TrackEvent, TrackStatistics,
    TrackSubscription,
};

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Channel capacity for each attached sink.
///
/// A sink that falls this far behind starts losing packets instead of
/// stalling the ingest loop.
pub const SINK_CHANNEL_CAPACITY: usize = 256;
