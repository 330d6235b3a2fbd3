//! Duplex text link to the gateway.
//!
//! The correlator only sees a pair of channels. In production they are
//! pumped to and from a WebSocket by two background tasks; tests wire two
//! links back to back with [`Link::pair`].

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

use crate::error::SignalingError;
use crate::{SignalingResult, GATEWAY_SUBPROTOCOL, LINK_CHANNEL_CAPACITY};

/// One end of a text message link.
#[derive(Debug)]
pub struct Link {
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) inbound: mpsc::Receiver<String>,
}

impl Link {
    /// Build a link from raw channel halves.
    pub fn new(outbound: mpsc::Sender<String>, inbound: mpsc::Receiver<String>) -> Self {
        Self { outbound, inbound }
    }

    /// Two links connected back to back.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (Link::new(a_tx, b_rx), Link::new(b_tx, a_rx))
    }

    /// Send one message.
    pub async fn send(&self, text: String) -> SignalingResult<()> {
        self.outbound
            .send(text)
            .await
            .map_err(|_| SignalingError::ConnectionLost("link closed".to_string()))
    }

    /// Receive one message. `None` once the other side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Open a WebSocket to the gateway, requesting its sub-protocol.
    #[instrument(name = "gateway_ws_connect")]
    pub async fn connect_websocket(url: &str) -> SignalingResult<Link> {
        let url = parse_gateway_url(url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(GATEWAY_SUBPROTOCOL),
        );

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        match response.headers().get("Sec-WebSocket-Protocol") {
            Some(p) if p == GATEWAY_SUBPROTOCOL => {}
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "gateway did not accept sub-protocol {} (got {:?})",
                    GATEWAY_SUBPROTOCOL, other
                )));
            }
        }

        info!("Connected to gateway");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                trace!(%text, "-> gateway");
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Failed to send to gateway: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Gateway writer stopped");
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary frame from gateway");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Gateway closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Gateway read error: {}", e);
                        break;
                    }
                };
                trace!(%text, "<- gateway");
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
            debug!("Gateway reader stopped");
        });

        Ok(Link::new(out_tx, in_rx))
    }
}

/// Check that `url` is a `ws://` or `wss://` address with a host.
pub fn parse_gateway_url(url: &str) -> SignalingResult<Url> {
    let parsed = Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(SignalingError::InvalidUrl(
            "URL must start with ws:// or wss://".to_string(),
        ));
    }
    if parsed.host_str().is_none() {
        return Err(SignalingError::InvalidUrl("Missing host".to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_cross_wired() {
        let (a, mut b) = Link::pair();
        a.send("hello".to_string()).await.unwrap();
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_fails() {
        let (a, b) = Link::pair();
        drop(b);
        assert!(matches!(
            a.send("x".to_string()).await,
            Err(SignalingError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_gateway_url_validation() {
        assert!(parse_gateway_url("wss://gateway.example:8989/ws").is_ok());
        assert!(matches!(
            parse_gateway_url("http://gateway.example"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_gateway_url("not a url"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = Link::connect_websocket("ws://127.0.0.1:1").await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
