//! WebRTC side of the bridge.
//!
//! - [`Capabilities`]: the fixed codec, feedback and header extension set.
//! - [`Endpoint`]: builds [`Transport`]s in either offer direction.
//! - [`MediaRelay`]: attaches the shared ingest tracks to a transport's
//!   outgoing stream.

mod capabilities;
mod endpoint;
mod error;
mod pump;
pub mod sdp;
mod relay;
mod transport;

pub use capabilities::{Capabilities, Capability, CodecCapability, Feedback};
pub use endpoint::{Endpoint, EndpointConfig, PendingOffer};
pub use error::WebRtcError;
pub use pump::{SampleSink, DEFAULT_AUDIO_FRAME_MS, DEFAULT_VIDEO_FRAME_MS};
pub use relay::{Attachment, AttachmentStatistics, MediaRelay};
pub use transport::{OutgoingStream, Transport, TransportDirection};

/// Result type for WebRTC operations.
pub type WebRtcResult<T> = Result<T, WebRtcError>;

/// Payload type advertised for Opus.
pub const AUDIO_PAYLOAD_TYPE: u8 = 96;

/// Payload type advertised for H.264.
pub const VIDEO_PAYLOAD_TYPE: u8 = 100;

/// Payload type of the H.264 retransmission stream.
pub const VIDEO_RTX_PAYLOAD_TYPE: u8 = 101;

/// Default wait for ICE gathering before sending a description anyway.
pub const DEFAULT_ICE_GATHER_TIMEOUT_SECS: u64 = 5;
