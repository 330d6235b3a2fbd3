//! Gateway publish state machine.
//!
//! Each step checks it is being called from the right state, exchanges
//! one request with the gateway and either advances the state or moves it
//! to [`SignalingState::Failed`]. A failed session stays failed; retrying
//! means building a new session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::correlator::{Correlator, TransactionId};
use crate::error::SignalingError;
use crate::link::Link;
use crate::protocol::{Body, GatewayMessage, JsepType, Jsep, PluginData, Request};
use crate::state::{SignalingPhase, SignalingState};
use crate::{
    SignalingResult, DEFAULT_KEEPALIVE_SECS, DEFAULT_TRANSACTION_TIMEOUT_SECS, VIDEOROOM_PLUGIN,
};

/// Gateway and room parameters for publishing.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket address of the gateway.
    pub url: String,

    /// Plugin to attach.
    pub plugin: String,

    /// Opaque participant token sent with `attach`.
    pub attach_token: String,

    /// Room to join.
    pub room: u64,

    /// Participant id sent with the join.
    pub participant: String,

    /// Display name in the room.
    pub display: String,

    /// Bitrate cap requested from the room, in bits per second.
    pub bitrate: u64,

    /// Agent string reported to the room.
    pub agent: String,

    /// Media type tag for the join (`main`).
    pub mtype: Option<String>,

    /// Public address reported with the join, when the room wants one.
    pub advertised_ip: Option<String>,

    /// Public port reported with the join.
    pub advertised_port: Option<String>,

    /// Wait for each reply.
    pub transaction_timeout: Duration,

    /// Interval between session keepalives.
    pub keepalive_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8188".to_string(),
            plugin: VIDEOROOM_PLUGIN.to_string(),
            attach_token: String::new(),
            room: 1234,
            participant: "rtmp-bridge".to_string(),
            display: "rtmp-bridge".to_string(),
            bitrate: 4_194_304,
            agent: "rtmp-to-webrtc bridge".to_string(),
            mtype: Some("main".to_string()),
            advertised_ip: None,
            advertised_port: None,
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
        }
    }
}

/// One publish session against the gateway.
pub struct GatewaySession {
    config: GatewayConfig,
    correlator: Option<Arc<Correlator>>,
    state: Arc<RwLock<SignalingState>>,
    keepalive: Option<JoinHandle<()>>,
}

impl GatewaySession {
    /// Create a disconnected session.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            correlator: None,
            state: Arc::new(RwLock::new(SignalingState::Disconnected)),
            keepalive: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SignalingState {
        self.state.read().clone()
    }

    /// Shared view of the state for observers.
    pub fn state_handle(&self) -> Arc<RwLock<SignalingState>> {
        self.state.clone()
    }

    /// Session configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open the WebSocket to the configured gateway.
    #[instrument(name = "gateway_connect", skip(self), fields(url = %self.config.url))]
    pub async fn connect(&mut self) -> SignalingResult<()> {
        self.expect(SignalingPhase::Connect)?;
        info!("{}", SignalingPhase::Connect.name());

        match Link::connect_websocket(&self.config.url).await {
            Ok(link) => self.connect_with(link),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Use an already established link.
    pub fn connect_with(&mut self, link: Link) -> SignalingResult<()> {
        self.expect(SignalingPhase::Connect)?;
        self.correlator = Some(Arc::new(Correlator::new(link)));
        self.set_state(SignalingState::Connected);
        Ok(())
    }

    /// Create the gateway session. Returns its id.
    #[instrument(name = "gateway_create_session", skip(self))]
    pub async fn create_session(&mut self) -> SignalingResult<u64> {
        self.expect(SignalingPhase::CreateSession)?;
        info!("{}", SignalingPhase::CreateSession.name());

        let result = self.request_id(&Request::Create, "create").await;
        let session_id = self.check(result)?;

        info!(session_id, "Gateway session created");
        self.set_state(SignalingState::SessionCreated { session_id });
        self.start_keepalive(session_id);
        Ok(session_id)
    }

    /// Attach the plugin handle. Returns its id.
    #[instrument(name = "gateway_attach", skip(self))]
    pub async fn attach_plugin(&mut self) -> SignalingResult<u64> {
        self.expect(SignalingPhase::AttachPlugin)?;
        info!(plugin = %self.config.plugin, "{}", SignalingPhase::AttachPlugin.name());

        let session_id = self.session_id()?;
        let request = Request::Attach {
            session_id,
            plugin: self.config.plugin.clone(),
            participant: self.config.attach_token.clone(),
        };
        let result = self.request_id(&request, "attach").await;
        let handle_id = self.check(result)?;

        info!(session_id, handle_id, "Plugin attached");
        self.set_state(SignalingState::PluginAttached {
            session_id,
            handle_id,
        });
        Ok(handle_id)
    }

    /// Join the room as publisher.
    ///
    /// Only the asynchronous event decides: it must report `joined`.
    #[instrument(name = "gateway_join", skip(self), fields(room = self.config.room))]
    pub async fn join_room(&mut self) -> SignalingResult<()> {
        self.expect(SignalingPhase::JoinRoom)?;
        info!("{}", SignalingPhase::JoinRoom.name());

        let (session_id, handle_id) = self.handle_ids()?;
        let request = Request::Message {
            session_id,
            handle_id,
            body: Body::JoinAndConfigure {
                ptype: "publisher".to_string(),
                room: self.config.room,
                participant: self.config.participant.clone(),
                display: self.config.display.clone(),
                bitrate: self.config.bitrate,
                agent: self.config.agent.clone(),
                mtype: self.config.mtype.clone(),
                alinip: self.config.advertised_ip.clone(),
                alinport: self.config.advertised_port.clone(),
            },
            jsep: None,
        };

        let result = self.message_exchange(&request).await.and_then(check_joined);
        let publisher_id = self.check(result)?;

        info!(room = self.config.room, ?publisher_id, "Joined room as publisher");
        self.set_state(SignalingState::RoomJoined {
            session_id,
            handle_id,
            room: self.config.room,
        });
        Ok(())
    }

    /// Send the local offer and return the gateway's answer SDP.
    #[instrument(name = "gateway_negotiate", skip(self, offer_sdp))]
    pub async fn negotiate(&mut self, offer_sdp: &str) -> SignalingResult<String> {
        self.expect(SignalingPhase::Negotiate)?;
        info!("{}", SignalingPhase::Negotiate.name());

        let (session_id, handle_id) = self.handle_ids()?;
        let request = Request::Message {
            session_id,
            handle_id,
            body: Body::Configure {
                audio: true,
                video: true,
                data: false,
            },
            jsep: Some(Jsep::offer(offer_sdp)),
        };

        let result = self.message_exchange(&request).await.and_then(extract_answer);
        let answer = self.check(result)?;

        info!(answer_len = answer.len(), "Gateway answered offer");
        self.set_state(SignalingState::Negotiated {
            session_id,
            handle_id,
            room: self.config.room,
        });
        Ok(answer)
    }

    /// Stop the keepalive and drop the link.
    pub fn close(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if self.correlator.take().is_some() {
            debug!("Gateway link dropped");
        }
        let mut state = self.state.write();
        if !state.is_failed() {
            *state = SignalingState::Disconnected;
        }
    }

    fn expect(&self, phase: SignalingPhase) -> SignalingResult<()> {
        let state = self.state.read();
        if SignalingPhase::for_state(&state) == Some(phase) {
            Ok(())
        } else {
            Err(SignalingError::InvalidState {
                operation: phase.operation(),
                state: state.clone(),
            })
        }
    }

    fn set_state(&self, state: SignalingState) {
        debug!(state = state.name(), "Signaling state changed");
        *self.state.write() = state;
    }

    fn check<T>(&mut self, result: SignalingResult<T>) -> SignalingResult<T> {
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: SignalingError) -> SignalingError {
        error!(error = %err, "Gateway signaling failed");
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        self.set_state(SignalingState::Failed {
            reason: err.to_string(),
        });
        err
    }

    fn correlator(&self) -> SignalingResult<Arc<Correlator>> {
        self.correlator
            .clone()
            .ok_or_else(|| SignalingError::ConnectionLost("no gateway link".to_string()))
    }

    fn session_id(&self) -> SignalingResult<u64> {
        let state = self.state.read();
        state
            .session_id()
            .ok_or_else(|| SignalingError::InvalidState {
                operation: "read session id",
                state: state.clone(),
            })
    }

    fn handle_ids(&self) -> SignalingResult<(u64, u64)> {
        match &*self.state.read() {
            SignalingState::PluginAttached {
                session_id,
                handle_id,
            }
            | SignalingState::RoomJoined {
                session_id,
                handle_id,
                ..
            } => Ok((*session_id, *handle_id)),
            other => Err(SignalingError::InvalidState {
                operation: "read handle id",
                state: other.clone(),
            }),
        }
    }

    /// A request answered by `success` carrying a non-zero `data.id`.
    async fn request_id(&self, request: &Request, what: &str) -> SignalingResult<u64> {
        let correlator = self.correlator()?;
        let reply = correlator
            .request(request, self.config.transaction_timeout)
            .await?;

        match reply {
            GatewayMessage::Success { data, .. } => match data.map(|d| d.id) {
                Some(id) if id != 0 => Ok(id),
                _ => Err(SignalingError::ProtocolViolation(format!(
                    "{} reply carried no id",
                    what
                ))),
            },
            GatewayMessage::Error { error, .. } => Err(SignalingError::Gateway {
                code: error.code,
                reason: error.reason,
            }),
            other => Err(SignalingError::ProtocolViolation(format!(
                "unexpected '{}' reply to {}",
                other.kind(),
                what
            ))),
        }
    }

    /// Send a plugin message and wait past any acks for the reply that
    /// settles it.
    async fn message_exchange(&self, request: &Request) -> SignalingResult<GatewayMessage> {
        let correlator = self.correlator()?;
        let id = correlator.send(request).await?;
        let reply = self.await_settled(&correlator, &id).await;
        correlator.complete(&id);
        reply
    }

    async fn await_settled(
        &self,
        correlator: &Correlator,
        id: &TransactionId,
    ) -> SignalingResult<GatewayMessage> {
        let timeout = self.config.transaction_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = correlator
                .await_response(id, remaining)
                .await
                .map_err(|e| match e {
                    SignalingError::Timeout { transaction, .. } => SignalingError::Timeout {
                        transaction,
                        after: timeout,
                    },
                    other => other,
                })?;
            if message.is_ack() {
                debug!(transaction = %id, "Gateway acknowledged request");
                continue;
            }
            return Ok(message);
        }
    }

    fn start_keepalive(&mut self, session_id: u64) {
        let Ok(correlator) = self.correlator() else {
            return;
        };
        let interval = self.config.keepalive_interval;
        let timeout = self.config.transaction_timeout;

        self.keepalive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !correlator.is_open() {
                    break;
                }
                match correlator
                    .request(&Request::Keepalive { session_id }, timeout)
                    .await
                {
                    Ok(reply) => trace!(session_id, janus = reply.kind(), "Keepalive answered"),
                    Err(e) if e.is_connection_error() => {
                        warn!(session_id, "Keepalive stopped: {}", e);
                        break;
                    }
                    Err(e) => warn!(session_id, "Keepalive failed: {}", e),
                }
            }
        }));
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }
}

fn plugin_error(plugindata: &Option<PluginData>) -> Option<String> {
    let data = &plugindata.as_ref()?.data;
    match (&data.error_code, &data.error) {
        (None, None) => None,
        (code, reason) => Some(format!(
            "{} ({})",
            reason.as_deref().unwrap_or("plugin error"),
            code.map(|c| c.to_string()).unwrap_or_default()
        )),
    }
}

/// Accept only an event whose plugin data reports `joined`.
fn check_joined(message: GatewayMessage) -> SignalingResult<Option<u64>> {
    match message {
        GatewayMessage::Event { plugindata, .. } => {
            if let Some(reason) = plugin_error(&plugindata) {
                return Err(SignalingError::NegotiationFailed(format!(
                    "join refused: {}",
                    reason
                )));
            }
            let data = plugindata.map(|p| p.data).unwrap_or_default();
            match data.videoroom.as_deref() {
                Some("joined") => Ok(data.id),
                Some(other) => Err(SignalingError::NegotiationFailed(format!(
                    "join event reported '{}'",
                    other
                ))),
                None => Err(SignalingError::NegotiationFailed(
                    "join event carried no videoroom status".to_string(),
                )),
            }
        }
        GatewayMessage::Error { error, .. } => Err(SignalingError::Gateway {
            code: error.code,
            reason: error.reason,
        }),
        other => Err(SignalingError::NegotiationFailed(format!(
            "expected join event, got '{}'",
            other.kind()
        ))),
    }
}

/// Accept only an event carrying an SDP answer.
fn extract_answer(message: GatewayMessage) -> SignalingResult<String> {
    match message {
        GatewayMessage::Event {
            plugindata, jsep, ..
        } => {
            if let Some(reason) = plugin_error(&plugindata) {
                return Err(SignalingError::NegotiationFailed(format!(
                    "configure refused: {}",
                    reason
                )));
            }
            match jsep {
                Some(Jsep {
                    kind: JsepType::Answer,
                    sdp,
                }) if !sdp.is_empty() => Ok(sdp),
                Some(jsep) => Err(SignalingError::NegotiationFailed(format!(
                    "configure event carried {:?} instead of an answer",
                    jsep.kind
                ))),
                None => Err(SignalingError::NegotiationFailed(
                    "configure event carried no SDP".to_string(),
                )),
            }
        }
        GatewayMessage::Error { error, .. } => Err(SignalingError::Gateway {
            code: error.code,
            reason: error.reason,
        }),
        other => Err(SignalingError::NegotiationFailed(format!(
            "expected configure event, got '{}'",
            other.kind()
        ))),
    }
}
