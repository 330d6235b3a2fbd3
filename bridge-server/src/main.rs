//! RTMP to WebRTC bridge server.
//!
//! Accepts one RTMP publish, serves it to WebSocket-signaled viewers and,
//! when a gateway is configured, publishes it into a gateway room.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge_engine::{Bridge, BridgeConfig};
use bridge_ingest::IngestConfig;
use bridge_signaling::{parse_gateway_url, GatewayConfig, VIDEOROOM_PLUGIN};
use bridge_webrtc::EndpointConfig;

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "rtmp-bridge", version, about)]
struct Cli {
    /// Address of the viewer HTTP/WebSocket server.
    #[arg(long, env = "BRIDGE_VIEWER_LISTEN", default_value = "0.0.0.0:8000")]
    viewer_listen: SocketAddr,

    /// Address of the RTMP listener.
    #[arg(long, env = "BRIDGE_RTMP_LISTEN", default_value = "0.0.0.0:1935")]
    rtmp_listen: String,

    /// Only accept publishes with this stream key.
    #[arg(long, env = "BRIDGE_STREAM_KEY")]
    stream_key: Option<String>,

    /// Gateway WebSocket address. Gateway publishing is off without it.
    #[arg(long, env = "BRIDGE_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Publish into the gateway as soon as the server is up.
    #[arg(long, requires = "gateway_url")]
    connect_on_start: bool,

    #[arg(long, env = "BRIDGE_ROOM", default_value_t = 1234)]
    room: u64,

    #[arg(long, env = "BRIDGE_PARTICIPANT", default_value = "rtmp-bridge")]
    participant: String,

    #[arg(long, env = "BRIDGE_DISPLAY", default_value = "rtmp-bridge")]
    display: String,

    /// Opaque token sent when attaching the plugin.
    #[arg(long, env = "BRIDGE_ATTACH_TOKEN", default_value = "")]
    attach_token: String,

    #[arg(long, default_value = VIDEOROOM_PLUGIN)]
    plugin: String,

    /// Bitrate cap requested from the room, in bits per second.
    #[arg(long, default_value_t = 4_194_304)]
    bitrate: u64,

    #[arg(long, default_value = "rtmp-to-webrtc bridge")]
    agent: String,

    #[arg(long, default_value_t = 30)]
    transaction_timeout_secs: u64,

    #[arg(long, default_value_t = 25)]
    keepalive_secs: u64,

    /// Public IP advertised as a host candidate. Repeatable.
    #[arg(long = "nat-ip")]
    nat_ips: Vec<String>,

    /// STUN server URL. Repeatable.
    #[arg(long = "stun")]
    stun_servers: Vec<String>,

    #[arg(long, default_value_t = 5)]
    ice_gather_timeout_secs: u64,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        let gateway = self.gateway_url.as_ref().map(|url| GatewayConfig {
            url: url.clone(),
            plugin: self.plugin.clone(),
            attach_token: self.attach_token.clone(),
            room: self.room,
            participant: self.participant.clone(),
            display: self.display.clone(),
            bitrate: self.bitrate,
            agent: self.agent.clone(),
            transaction_timeout: Duration::from_secs(self.transaction_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
            ..GatewayConfig::default()
        });

        BridgeConfig {
            ingest: IngestConfig {
                listen_addr: self.rtmp_listen.clone(),
                stream_key: self.stream_key.clone(),
            },
            gateway,
            endpoint: EndpointConfig {
                nat_1to1_ips: self.nat_ips.clone(),
                stun_servers: self.stun_servers.clone(),
                ice_gather_timeout: Duration::from_secs(self.ice_gather_timeout_secs),
                ..EndpointConfig::default()
            },
            ..BridgeConfig::default()
        }
    }
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "rtmp_bridge=debug,bridge_engine=debug,bridge_ingest=debug,bridge_signaling=debug,bridge_webrtc=debug,bridge_media=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();
    info!("Bridge server starting");

    if let Some(url) = &cli.gateway_url {
        parse_gateway_url(url).context("invalid --gateway-url")?;
    }

    let cancel = CancellationToken::new();
    let bridge = Arc::new(
        Bridge::start(cli.bridge_config(), cancel.clone())
            .await
            .context("failed to start the bridge")?,
    );

    let listener = tokio::net::TcpListener::bind(cli.viewer_listen)
        .await
        .with_context(|| format!("failed to bind viewer server on {}", cli.viewer_listen))?;
    info!(
        viewer = %cli.viewer_listen,
        rtmp = %bridge.ingest_addr(),
        "Listening"
    );

    if cli.connect_on_start {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            match bridge.connect_gateway().await {
                Ok(state) => info!(%state, "Gateway publish started"),
                Err(e) => error!(error = %e, "Gateway publish on start failed"),
            }
        });
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    let app = routes::router(routes::AppState {
        bridge: bridge.clone(),
        cancel: cancel.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("viewer server failed")?;

    bridge.shutdown().await;
    info!("Bridge server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_gateway() {
        let cli = Cli::try_parse_from(["rtmp-bridge"]).unwrap();
        assert_eq!(cli.viewer_listen.port(), 8000);

        let config = cli.bridge_config();
        assert!(config.gateway.is_none());
        assert_eq!(config.ingest.listen_addr, "0.0.0.0:1935");
        assert_eq!(config.endpoint.ice_gather_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_gateway_flags() {
        let cli = Cli::try_parse_from([
            "rtmp-bridge",
            "--gateway-url",
            "wss://gateway.example/ws",
            "--room",
            "77",
            "--keepalive-secs",
            "10",
            "--nat-ip",
            "203.0.113.5",
            "--nat-ip",
            "203.0.113.6",
            "--connect-on-start",
        ])
        .unwrap();
        assert!(cli.connect_on_start);

        let config = cli.bridge_config();
        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.url, "wss://gateway.example/ws");
        assert_eq!(gateway.room, 77);
        assert_eq!(gateway.plugin, VIDEOROOM_PLUGIN);
        assert_eq!(gateway.bitrate, 4_194_304);
        assert_eq!(gateway.keepalive_interval, Duration::from_secs(10));
        assert_eq!(gateway.transaction_timeout, Duration::from_secs(30));
        assert_eq!(config.endpoint.nat_1to1_ips.len(), 2);
    }

    #[test]
    fn test_connect_on_start_needs_gateway() {
        assert!(Cli::try_parse_from(["rtmp-bridge", "--connect-on-start"]).is_err());
    }
}
