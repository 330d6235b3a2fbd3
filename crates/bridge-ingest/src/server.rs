//! RTMP listener.
//!
//! Accepts publisher connections, drives the server side of the RTMP
//! session with `rml_rtmp`, and hands demuxed media to the
//! [`IngestAdapter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::adapter::{IngestAdapter, PublishId};
use crate::connection::PublisherState;
use crate::error::IngestError;
use crate::flv::{DemuxEvent, FlvDemuxer};
use crate::{IngestResult, DEFAULT_RTMP_PORT, HANDSHAKE_TIMEOUT_SECS, READ_BUFFER_SIZE};

/// RTMP listener configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Address to listen on.
    pub listen_addr: String,

    /// Only accept publishes with this stream key.
    pub stream_key: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_RTMP_PORT),
            stream_key: None,
        }
    }
}

/// A bound RTMP listener.
pub struct IngestServer {
    listener: TcpListener,
    adapter: Arc<IngestAdapter>,
}

impl IngestServer {
    /// Bind the listener. Failing to bind is fatal for the caller.
    pub async fn bind(config: &IngestConfig, adapter: Arc<IngestAdapter>) -> IngestResult<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| IngestError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        info!(addr = %config.listen_addr, "RTMP listener bound");
        Ok(Self { listener, adapter })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> IngestResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept publishers until `cancel` fires, then wait for open
    /// connections to wind down.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let adapter = self.adapter.clone();
                        let cancel = cancel.child_token();
                        tracker.spawn(async move {
                            if let Err(e) = serve_publisher(stream, peer, adapter, cancel).await {
                                warn!(%peer, "Publisher connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("RTMP accept failed: {}", e);
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("RTMP listener stopped");
    }
}

#[instrument(name = "rtmp_publisher", skip(stream, adapter, cancel))]
async fn serve_publisher(
    mut stream: TcpStream,
    peer: SocketAddr,
    adapter: Arc<IngestAdapter>,
    cancel: CancellationToken,
) -> IngestResult<()> {
    debug!("Publisher connected, starting handshake");

    let leftover = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        server_handshake(&mut stream),
    )
    .await
    .map_err(|_| IngestError::Handshake("timed out".to_string()))??;

    let (session, initial_results) = ServerSession::new(ServerSessionConfig::new())
        .map_err(|e| IngestError::Protocol(format!("Session creation failed: {:?}", e)))?;

    let mut connection = PublisherConnection {
        stream,
        session,
        adapter,
        state: PublisherState::Handshaking,
        publish: None,
        demux: FlvDemuxer::new(),
    };

    connection.handle_results(initial_results).await?;
    if !leftover.is_empty() {
        let results = connection.feed(&leftover)?;
        connection.handle_results(results).await?;
    }

    let result = connection.serve(cancel).await;
    connection.finish(match &result {
        Ok(()) => "publisher disconnected".to_string(),
        Err(e) => e.to_string(),
    });
    result
}

/// Run the server side of the handshake. Returns bytes read past its end.
async fn server_handshake(stream: &mut TcpStream) -> IngestResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(IngestError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                debug!("Handshake complete");
                return Ok(remaining_bytes);
            }
            Err(e) => return Err(IngestError::Handshake(format!("{:?}", e))),
        }
    }
}

struct PublisherConnection {
    stream: TcpStream,
    session: ServerSession,
    adapter: Arc<IngestAdapter>,
    state: PublisherState,
    publish: Option<PublishId>,
    demux: FlvDemuxer,
}

impl PublisherConnection {
    async fn serve(&mut self, cancel: CancellationToken) -> IngestResult<()> {
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Shutdown requested, closing publisher");
                    return Ok(());
                }
                read = self.stream.read(&mut read_buf) => read?,
            };
            if n == 0 {
                return Ok(());
            }

            let results = self.feed(&read_buf[..n])?;
            self.handle_results(results).await?;
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> IngestResult<Vec<ServerSessionResult>> {
        self.session
            .handle_input(bytes)
            .map_err(|e| IngestError::Protocol(format!("Session input error: {:?}", e)))
    }

    async fn handle_results(&mut self, results: Vec<ServerSessionResult>) -> IngestResult<()> {
        for result in results {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    self.stream.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    self.handle_event(event).await?;
                }
                other => trace!("Unhandled session result: {:?}", other),
            }
        }
        Ok(())
    }

    async fn write_outbound(&mut self, results: Vec<ServerSessionResult>) -> IngestResult<()> {
        for result in results {
            if let ServerSessionResult::OutboundResponse(packet) = result {
                self.stream.write_all(&packet.bytes).await?;
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ServerSessionEvent) -> IngestResult<()> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
            } => {
                let results = self
                    .session
                    .accept_request(request_id)
                    .map_err(|e| IngestError::Protocol(format!("Accept failed: {:?}", e)))?;
                self.write_outbound(results).await?;
                info!(app = %app_name, "RTMP connect accepted");
                self.state = PublisherState::Connected { app_name };
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                ..
            } => {
                let claim = match self.publish {
                    Some(_) => Err(IngestError::PublishRejected(
                        "connection is already publishing".to_string(),
                    )),
                    None => self.adapter.claim(&stream_key),
                };

                match claim {
                    Ok(id) => {
                        let results = self.session.accept_request(request_id).map_err(|e| {
                            IngestError::Protocol(format!("Accept failed: {:?}", e))
                        })?;
                        self.write_outbound(results).await?;
                        self.publish = Some(id);
                        self.demux = FlvDemuxer::new();
                        self.state = PublisherState::Publishing {
                            app_name,
                            stream_key,
                        };
                        info!(publish = %id, "{}", self.state.message());
                    }
                    Err(e) => {
                        warn!(app = %app_name, stream_key = %stream_key, "Rejecting publish: {}", e);
                        match self.session.reject_request(
                            request_id,
                            "NetStream.Publish.BadName",
                            &e.to_string(),
                        ) {
                            Ok(results) => self.write_outbound(results).await?,
                            Err(re) => warn!("Error rejecting publish request: {:?}", re),
                        }
                        return Err(e);
                    }
                }
            }

            ServerSessionEvent::PlayStreamRequested { request_id, .. } => {
                debug!("Play requests are not served");
                if let Ok(results) = self.session.reject_request(
                    request_id,
                    "NetStream.Play.Failed",
                    "This server only accepts publishers",
                ) {
                    self.write_outbound(results).await?;
                }
            }

            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => self.on_media(data, timestamp.value, true)?,

            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => self.on_media(data, timestamp.value, false)?,

            ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
                debug!(?metadata, "Stream metadata");
            }

            ServerSessionEvent::PublishStreamFinished { stream_key, .. } => {
                info!(stream_key = %stream_key, "Publisher finished stream");
                self.end_publish();
                if let PublisherState::Publishing { app_name, .. } = &self.state {
                    self.state = PublisherState::Connected {
                        app_name: app_name.clone(),
                    };
                }
            }

            other => trace!("Session event: {:?}", other),
        }
        Ok(())
    }

    fn on_media(&mut self, data: Bytes, timestamp_ms: u32, is_video: bool) -> IngestResult<()> {
        let Some(id) = self.publish else {
            trace!("Media before publish accepted, ignoring");
            return Ok(());
        };

        let events = if is_video {
            self.demux.push_video(&data, timestamp_ms)?
        } else {
            self.demux.push_audio(&data, timestamp_ms)?
        };

        for event in events {
            match event {
                DemuxEvent::Started(descriptors) => {
                    self.adapter.on_publish_start(id, descriptors)?;
                }
                DemuxEvent::Packet(packet) => {
                    self.adapter.on_packet(id, packet)?;
                }
            }
        }
        Ok(())
    }

    fn end_publish(&mut self) {
        if let Some(id) = self.publish.take() {
            self.adapter.on_publish_end(id);
        }
    }

    fn finish(&mut self, reason: String) {
        self.end_publish();
        if !self.state.is_closed() {
            info!(state = self.state.name(), %reason, "Publisher connection closed");
            self.state = PublisherState::Closed { reason };
        }
    }
}

impl Drop for PublisherConnection {
    fn drop(&mut self) {
        self.end_publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_media::{IngestTrack, MediaKind};

    #[test]
    fn test_default_config_listens_on_rtmp_port() {
        let config = IngestConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:1935");
        assert!(config.stream_key.is_none());
    }

    #[tokio::test]
    async fn test_bind_and_cancel() {
        let adapter = Arc::new(IngestAdapter::new(
            Arc::new(IngestTrack::new(MediaKind::Audio)),
            Arc::new(IngestTrack::new(MediaKind::Video)),
            None,
        ));
        let config = IngestConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            stream_key: None,
        };
        let server = IngestServer::bind(&config, adapter).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let adapter = Arc::new(IngestAdapter::new(
            Arc::new(IngestTrack::new(MediaKind::Audio)),
            Arc::new(IngestTrack::new(MediaKind::Video)),
            None,
        ));
        let config = IngestConfig {
            listen_addr: "not-an-address".to_string(),
            stream_key: None,
        };
        assert!(matches!(
            IngestServer::bind(&config, adapter).await,
            Err(IngestError::Bind { .. })
        ));
    }
}
