//! Bridge configuration.

use std::time::Duration;

use bridge_ingest::IngestConfig;
use bridge_signaling::GatewayConfig;
use bridge_webrtc::EndpointConfig;

use crate::DEFAULT_STATS_INTERVAL_SECS;

/// Everything needed to start a [`crate::Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ingest: IngestConfig,

    /// Gateway to publish into; `None` disables gateway publishing.
    pub gateway: Option<GatewayConfig>,

    pub endpoint: EndpointConfig,

    /// How often stream statistics are logged while a publish is live.
    pub stats_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            gateway: None,
            endpoint: EndpointConfig::default(),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
        }
    }
}
