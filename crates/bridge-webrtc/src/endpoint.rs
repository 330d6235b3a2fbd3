//! Transport negotiation in both offer directions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::configure_rtcp_reports;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::nack::responder::Responder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::capabilities::Capabilities;
use crate::error::WebRtcError;
use crate::sdp::SdpSummary;
use crate::transport::{Transport, TransportDirection};
use crate::{WebRtcResult, DEFAULT_ICE_GATHER_TIMEOUT_SECS};

/// Endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Public IPs advertised as host candidates.
    pub nat_1to1_ips: Vec<String>,

    /// STUN server URLs.
    pub stun_servers: Vec<String>,

    /// Inclusive UDP port range for ICE, if restricted.
    pub udp_port_range: Option<(u16, u16)>,

    /// How long to wait for ICE gathering before sending a description.
    pub ice_gather_timeout: Duration,

    pub capabilities: Capabilities,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            nat_1to1_ips: Vec::new(),
            stun_servers: Vec::new(),
            udp_port_range: None,
            ice_gather_timeout: Duration::from_secs(DEFAULT_ICE_GATHER_TIMEOUT_SECS),
            capabilities: Capabilities::default(),
        }
    }
}

/// Builds transports that advertise the configured capabilities.
pub struct Endpoint {
    api: API,
    config: EndpointConfig,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> WebRtcResult<Self> {
        let media_engine = config.capabilities.media_engine()?;

        // Only reports and NACK responses: the default set would repeat the
        // feedback lines already registered with each codec.
        let mut registry = Registry::new();
        registry = configure_rtcp_reports(registry);
        registry.add(Box::new(Responder::builder()));

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = config.udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max).map_err(|e| {
                WebRtcError::Config(format!("invalid UDP port range {}-{}: {}", min, max, e))
            })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        if !config.nat_1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(config.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        info!(
            nat_ips = ?config.nat_1to1_ips,
            stun = ?config.stun_servers,
            ports = ?config.udp_port_range,
            "WebRTC endpoint ready"
        );

        Ok(Self { api, config })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.config.capabilities
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    async fn new_transport(&self, direction: TransportDirection) -> WebRtcResult<Transport> {
        let rtc_config = RTCConfiguration {
            ice_servers: if self.config.stun_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.config.stun_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let peer = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        Transport::new(peer, &self.config.capabilities, direction).await
    }

    /// Start an outbound-initiated exchange: build a transport and its
    /// offer.
    #[instrument(name = "webrtc_offer", skip(self))]
    pub async fn offer(&self) -> WebRtcResult<PendingOffer> {
        let transport = self.new_transport(TransportDirection::OutboundInitiated).await?;
        let bound = bind_offer(&transport, self.config.ice_gather_timeout).await;
        let sdp = close_on_error(&transport, bound).await?;

        debug!(transport = %transport.id(), len = sdp.len(), "Local offer ready");
        Ok(PendingOffer {
            transport,
            sdp,
            capabilities: self.config.capabilities.clone(),
        })
    }

    /// Inbound-initiated exchange: bind the remote offer, answer it, and
    /// return the bound transport with the answer SDP.
    #[instrument(name = "webrtc_answer", skip(self, remote_offer))]
    pub async fn answer(&self, remote_offer: &str) -> WebRtcResult<(Transport, String)> {
        let summary = SdpSummary::parse(remote_offer)?;
        self.config.capabilities.verify_remote(&summary)?;

        let transport = self.new_transport(TransportDirection::InboundInitiated).await?;
        let bound = bind_answer(&transport, remote_offer, self.config.ice_gather_timeout).await;
        let sdp = close_on_error(&transport, bound).await?;

        info!(transport = %transport.id(), "Answered remote offer");
        Ok((transport, sdp))
    }
}

/// A transport with its local offer applied, waiting for the answer.
pub struct PendingOffer {
    transport: Transport,
    sdp: String,
    capabilities: Capabilities,
}

impl PendingOffer {
    /// The local offer, with gathered candidates.
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Bind the remote answer. The transport is closed if the answer does
    /// not fit the offered capabilities.
    #[instrument(name = "webrtc_accept_answer", skip_all, fields(transport = %self.transport.id()))]
    pub async fn accept_answer(self, answer: &str) -> WebRtcResult<Transport> {
        let bound = async {
            let summary = SdpSummary::parse(answer)?;
            self.capabilities.verify_remote(&summary)?;
            let description = RTCSessionDescription::answer(answer.to_string())?;
            self.transport.peer().set_remote_description(description).await?;
            Ok::<(), WebRtcError>(())
        }
        .await;

        match bound {
            Ok(()) => {
                info!(transport = %self.transport.id(), "Remote answer bound");
                Ok(self.transport)
            }
            Err(e) => {
                warn!(transport = %self.transport.id(), error = %e, "Rejecting remote answer");
                self.transport.close().await;
                Err(e)
            }
        }
    }

    /// Give up on the exchange.
    pub async fn abandon(self) {
        self.transport.close().await;
    }
}

/// Close a transport whose negotiation step failed.
async fn close_on_error<T>(transport: &Transport, result: WebRtcResult<T>) -> WebRtcResult<T> {
    if let Err(e) = &result {
        warn!(transport = %transport.id(), error = %e, "Negotiation failed, closing transport");
        transport.close().await;
    }
    result
}

async fn bind_offer(transport: &Transport, gather_timeout: Duration) -> WebRtcResult<String> {
    let offer = transport.peer().create_offer(None).await?;
    set_local_and_gather(transport.peer(), offer, gather_timeout).await
}

async fn bind_answer(
    transport: &Transport,
    remote_offer: &str,
    gather_timeout: Duration,
) -> WebRtcResult<String> {
    let offer = RTCSessionDescription::offer(remote_offer.to_string())?;
    transport.peer().set_remote_description(offer).await?;
    let answer = transport.peer().create_answer(None).await?;
    set_local_and_gather(transport.peer(), answer, gather_timeout).await
}

/// Apply a local description and wait (bounded) for ICE gathering so the
/// returned SDP carries candidates.
async fn set_local_and_gather(
    peer: &RTCPeerConnection,
    description: RTCSessionDescription,
    gather_timeout: Duration,
) -> WebRtcResult<String> {
    let mut gathering_complete = peer.gathering_complete_promise().await;
    peer.set_local_description(description).await?;

    if tokio::time::timeout(gather_timeout, gathering_complete.recv())
        .await
        .is_err()
    {
        warn!(
            timeout_ms = gather_timeout.as_millis() as u64,
            "ICE gathering did not complete, sending the candidates found so far"
        );
    }

    peer.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| WebRtcError::Sdp("local description missing after apply".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_negotiation_closes_transport() {
        let endpoint = Endpoint::new(EndpointConfig::default()).unwrap();
        let transport = endpoint
            .new_transport(TransportDirection::OutboundInitiated)
            .await
            .unwrap();
        let closed = transport.closed();

        let failed: WebRtcResult<String> =
            Err(WebRtcError::Sdp("local description missing after apply".to_string()));
        assert!(close_on_error(&transport, failed).await.is_err());
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_successful_negotiation_keeps_transport() {
        let endpoint = Endpoint::new(EndpointConfig {
            ice_gather_timeout: Duration::from_millis(500),
            ..EndpointConfig::default()
        })
        .unwrap();
        let transport = endpoint
            .new_transport(TransportDirection::OutboundInitiated)
            .await
            .unwrap();

        let bound = bind_offer(&transport, endpoint.config().ice_gather_timeout).await;
        let sdp = close_on_error(&transport, bound).await.unwrap();
        assert!(sdp.contains("m=video"));
        assert!(!transport.is_closed());

        transport.close().await;
    }
}
