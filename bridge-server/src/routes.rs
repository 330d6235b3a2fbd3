//! HTTP and WebSocket routes of the viewer server.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bridge_engine::{Bridge, BridgeStatus, EngineError, ViewerMessage};

/// Largest signaling message accepted from a viewer.
const MAX_VIEWER_MESSAGE_SIZE: usize = 64 * 1024;

/// State shared with the route handlers.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channel", get(viewer_channel))
        .route("/connect", post(connect_gateway))
        .route("/status", get(status))
        .with_state(state)
}

async fn viewer_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_VIEWER_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_viewer(socket, state))
}

/// One offer/answer round trip, then relay until the socket closes.
async fn handle_viewer(mut socket: WebSocket, state: AppState) {
    let Some(offer) = next_text(&mut socket).await else {
        debug!("Viewer left before sending an offer");
        return;
    };

    let sdp = match ViewerMessage::parse_offer(&offer) {
        Ok(sdp) => sdp,
        Err(e) => {
            warn!(error = %e, "Invalid viewer message");
            return;
        }
    };

    let session = match state.bridge.answer_viewer(&sdp).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Viewer negotiation failed");
            return;
        }
    };

    if let Err(e) = socket
        .send(Message::Text(session.answer().to_json().into()))
        .await
    {
        warn!(viewer = %session.id(), error = %e, "Failed to send answer");
        session.finish().await;
        return;
    }

    let cancel = state.cancel.clone();
    session
        .run_until(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = drain(&mut socket) => {}
            }
        })
        .await;
}

/// Next text frame, skipping control frames.
async fn next_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Read and discard frames until the viewer goes away.
async fn drain(socket: &mut WebSocket) {
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Text(_)) => debug!("Ignoring viewer message after the answer"),
            Ok(_) => {}
        }
    }
}

async fn connect_gateway(State(state): State<AppState>) -> Response {
    match state.bridge.connect_gateway().await {
        Ok(gateway_state) => {
            info!(state = %gateway_state, "Gateway connect requested");
            Json(json!({ "state": gateway_state })).into_response()
        }
        Err(e) => {
            let status = match e {
                EngineError::GatewayDisabled => StatusCode::NOT_FOUND,
                EngineError::GatewayBusy => StatusCode::CONFLICT,
                EngineError::PublishCancelled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.bridge.status())
}
