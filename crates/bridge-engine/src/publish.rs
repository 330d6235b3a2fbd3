//! Publishing the ingest stream into a gateway room.

use std::sync::Arc;

use bridge_signaling::{
    GatewayConfig, GatewaySession, Link, SignalingPhase, SignalingResult, SignalingState,
};
use bridge_webrtc::{Attachment, AttachmentStatistics, Endpoint, MediaRelay, Transport};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::viewer::{RelayRegistry, RelayRole};
use crate::EngineResult;

/// A negotiated gateway session relaying the ingest tracks.
pub struct Publication {
    session: GatewaySession,
    transport: Transport,
    attachment: Arc<Attachment>,
    registry: Arc<RelayRegistry>,
}

impl Publication {
    pub fn state(&self) -> SignalingState {
        self.session.state()
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    pub fn statistics(&self) -> AttachmentStatistics {
        self.attachment.statistics()
    }

    /// Whether media is still flowing to the gateway.
    pub fn is_active(&self) -> bool {
        self.session.state().is_negotiated() && !self.transport.is_closed()
    }

    /// Detach from the relay, close the transport and drop the gateway link.
    pub async fn close(mut self) {
        self.registry.remove(self.transport.id());
        self.transport.close().await;
        self.session.close();
        info!(transport = %self.transport.id(), "Gateway publication closed");
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.registry.remove(self.transport.id());
    }
}

/// Runs the gateway publish flow phase by phase.
pub struct GatewayPublisher {
    config: GatewayConfig,
    endpoint: Arc<Endpoint>,
    relay: MediaRelay,
    registry: Arc<RelayRegistry>,
    phase: RwLock<Option<SignalingPhase>>,
    last_state: RwLock<SignalingState>,
}

impl GatewayPublisher {
    pub fn new(
        config: GatewayConfig,
        endpoint: Arc<Endpoint>,
        relay: MediaRelay,
        registry: Arc<RelayRegistry>,
    ) -> Self {
        Self {
            config,
            endpoint,
            relay,
            registry,
            phase: RwLock::new(None),
            last_state: RwLock::new(SignalingState::Disconnected),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Phase currently running, if a publish is in progress.
    pub fn phase(&self) -> Option<SignalingPhase> {
        *self.phase.read()
    }

    /// State reached by the last publish attempt.
    pub fn last_state(&self) -> SignalingState {
        self.last_state.read().clone()
    }

    /// Connect to the configured gateway and publish.
    pub async fn publish(&self) -> EngineResult<Publication> {
        self.publish_until(None, &CancellationToken::new()).await
    }

    /// Publish over an already open link.
    pub async fn publish_with(&self, link: Link) -> EngineResult<Publication> {
        self.publish_until(Some(link), &CancellationToken::new()).await
    }

    /// Run the publish flow, giving up with
    /// [`EngineError::PublishCancelled`] once `cancel` fires.
    #[instrument(name = "gateway_publish", skip_all, fields(room = self.config.room))]
    pub(crate) async fn publish_until(
        &self,
        mut link: Option<Link>,
        cancel: &CancellationToken,
    ) -> EngineResult<Publication> {
        let mut attempt = Attempt::begin(&self.phase, &self.last_state);
        let mut session = GatewaySession::new(self.config.clone());
        let mut phase = SignalingPhase::first();

        let signaled = loop {
            attempt.enter(phase);
            info!(phase = phase.name(), "Gateway publish phase");

            if phase == SignalingPhase::Negotiate {
                break Ok(());
            }
            let step = tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::PublishCancelled),
                result = advance(&mut session, phase, &mut link) => result.map_err(EngineError::from),
            };
            if let Err(e) = step {
                break Err(e);
            }
            match phase.next() {
                Some(next) => phase = next,
                None => break Ok(()),
            }
        };

        let outcome = match signaled {
            Ok(()) => match self.negotiate(&mut session, cancel).await {
                Ok(transport) => match self.relay.attach(&transport).await {
                    Ok(attachment) => Ok((transport, attachment)),
                    Err(e) => {
                        transport.close().await;
                        Err(e.into())
                    }
                },
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        attempt.settle();

        match outcome {
            Ok((transport, attachment)) => {
                let attachment = Arc::new(attachment);
                self.registry.insert(RelayRole::Gateway, attachment.clone());
                *self.last_state.write() = session.state();
                info!(
                    transport = %transport.id(),
                    state = %session.state(),
                    "Publishing into gateway room"
                );
                Ok(Publication {
                    session,
                    transport,
                    attachment,
                    registry: self.registry.clone(),
                })
            }
            Err(e) => {
                error!(phase = phase.name(), error = %e, "Gateway publish failed");
                self.rollback(&mut session, &e);
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        session: &mut GatewaySession,
        cancel: &CancellationToken,
    ) -> EngineResult<Transport> {
        let offer = self.endpoint.offer().await?;
        debug!(transport = %offer.transport().id(), "Sending offer to gateway");
        let answer = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::PublishCancelled),
            result = session.negotiate(offer.sdp()) => result.map_err(EngineError::from),
        };
        match answer {
            Ok(answer) => Ok(offer.accept_answer(&answer).await?),
            Err(e) => {
                offer.abandon().await;
                Err(e)
            }
        }
    }

    fn rollback(&self, session: &mut GatewaySession, cause: &EngineError) {
        let state = match session.state() {
            failed @ SignalingState::Failed { .. } => failed,
            _ => SignalingState::Failed {
                reason: cause.to_string(),
            },
        };
        session.close();
        *self.last_state.write() = state;
    }
}

/// Publishes the running phase for the duration of one attempt.
///
/// Dropping an attempt that was never settled records it as failed, so a
/// caller that abandons the publish future leaves no phase behind.
struct Attempt<'a> {
    phase: &'a RwLock<Option<SignalingPhase>>,
    last_state: &'a RwLock<SignalingState>,
    settled: bool,
}

impl<'a> Attempt<'a> {
    fn begin(
        phase: &'a RwLock<Option<SignalingPhase>>,
        last_state: &'a RwLock<SignalingState>,
    ) -> Self {
        Self {
            phase,
            last_state,
            settled: false,
        }
    }

    fn enter(&self, phase: SignalingPhase) {
        *self.phase.write() = Some(phase);
    }

    fn settle(&mut self) {
        self.settled = true;
        *self.phase.write() = None;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let phase = self.phase.write().take();
        warn!(phase = ?phase.map(SignalingPhase::name), "Gateway publish abandoned");
        *self.last_state.write() = SignalingState::Failed {
            reason: "publish abandoned".to_string(),
        };
    }
}

/// Run one signaling step. The offer/answer step needs the endpoint and is
/// driven by [`GatewayPublisher::negotiate`].
async fn advance(
    session: &mut GatewaySession,
    phase: SignalingPhase,
    link: &mut Option<Link>,
) -> SignalingResult<()> {
    match phase {
        SignalingPhase::Connect => match link.take() {
            Some(link) => session.connect_with(link),
            None => session.connect().await,
        },
        SignalingPhase::CreateSession => session.create_session().await.map(drop),
        SignalingPhase::AttachPlugin => session.attach_plugin().await.map(drop),
        SignalingPhase::JoinRoom => session.join_room().await,
        SignalingPhase::Negotiate => Ok(()),
    }
}
