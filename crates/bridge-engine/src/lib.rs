//! Core orchestrator for the bridge.
//!
//! [`Bridge`] owns the shared ingest tracks, the RTMP listener, the WebRTC
//! endpoint and the media relay. It publishes into a gateway room on
//! request and answers direct viewers, attaching every negotiated
//! transport to the same tracks.

mod bridge;
mod config;
mod error;
mod metrics;
mod publish;
mod viewer;

pub use bridge::{Bridge, BridgeStatus, GatewayStatus};
pub use config::BridgeConfig;
pub use error::EngineError;
pub use metrics::{MetricsCollector, StreamMetrics, StreamWarning};
pub use publish::{GatewayPublisher, Publication};
pub use viewer::{RelayRegistry, RelayRole, ViewerMessage, ViewerSession};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Default interval between stream statistics log lines.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
