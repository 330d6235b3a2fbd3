//! Gateway signaling.
//!
//! Talks to a Janus-style gateway over a persistent WebSocket: a
//! [`Correlator`] matches replies to requests by transaction id, and
//! [`GatewaySession`] drives create → attach → join → configure until the
//! gateway returns an SDP answer for the local offer.

mod correlator;
mod error;
mod link;
pub mod protocol;
mod session;
mod state;

pub use correlator::{Correlator, TransactionId};
pub use error::SignalingError;
pub use link::{parse_gateway_url, Link};
pub use session::{GatewayConfig, GatewaySession};
pub use state::{SignalingPhase, SignalingState};

/// Result type for signaling operations.
pub type SignalingResult<T> = Result<T, SignalingError>;

/// WebSocket sub-protocol spoken by the gateway.
pub const GATEWAY_SUBPROTOCOL: &str = "janus-protocol";

/// Plugin joined for publishing.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Default wait for a reply to a single request.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

/// Default interval between session keepalives.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 25;

/// Buffered messages per direction on a link.
pub const LINK_CHANNEL_CAPACITY: usize = 64;

/// Length of generated transaction identifiers.
pub const TRANSACTION_ID_LEN: usize = 12;
