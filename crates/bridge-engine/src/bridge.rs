//! Main bridge orchestrator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_ingest::{IngestAdapter, IngestServer, IngestStatistics};
use bridge_media::{IngestTrack, MediaKind};
use bridge_signaling::{Link, SignalingPhase, SignalingState};
use bridge_webrtc::{Endpoint, MediaRelay};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::BridgeConfig;
use crate::error::EngineError;
use crate::metrics::{MetricsCollector, StreamMetrics};
use crate::publish::{GatewayPublisher, Publication};
use crate::viewer::{RelayRegistry, ViewerSession};
use crate::EngineResult;

/// Gateway side of [`BridgeStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub state: SignalingState,
    /// Phase in progress while a publish is running.
    pub phase: Option<SignalingPhase>,
    pub publishing: bool,
}

/// Snapshot served on the status route.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub publish_live: bool,
    pub stream_key: Option<String>,
    pub viewers: usize,
    pub relayed_transports: usize,
    /// `None` when no gateway is configured.
    pub gateway: Option<GatewayStatus>,
    pub ingest: IngestStatistics,
    pub metrics: StreamMetrics,
}

/// Clears the busy flag when a publish attempt ends.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag.clone()))
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The running bridge.
pub struct Bridge {
    adapter: Arc<IngestAdapter>,
    endpoint: Arc<Endpoint>,
    relay: MediaRelay,
    registry: Arc<RelayRegistry>,
    publisher: Option<Arc<GatewayPublisher>>,
    publication: Arc<Mutex<Option<Publication>>>,
    publishing: Arc<AtomicBool>,
    metrics: Arc<MetricsCollector>,
    ingest_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Bridge {
    /// Bind the RTMP listener, build the endpoint and start the background
    /// tasks. Stops when `cancel` fires.
    #[instrument(name = "bridge_start", skip_all)]
    pub async fn start(config: BridgeConfig, cancel: CancellationToken) -> EngineResult<Self> {
        let audio = Arc::new(IngestTrack::new(MediaKind::Audio));
        let video = Arc::new(IngestTrack::new(MediaKind::Video));
        let adapter = Arc::new(IngestAdapter::new(
            audio.clone(),
            video.clone(),
            config.ingest.stream_key.clone(),
        ));

        let server = IngestServer::bind(&config.ingest, adapter.clone()).await?;
        let ingest_addr = server.local_addr()?;

        let endpoint = Arc::new(Endpoint::new(config.endpoint.clone())?);
        let relay = MediaRelay::new(audio, video);
        let registry = Arc::new(RelayRegistry::new());
        let publisher = config.gateway.clone().map(|gateway| {
            Arc::new(GatewayPublisher::new(
                gateway,
                endpoint.clone(),
                relay.clone(),
                registry.clone(),
            ))
        });
        let metrics = Arc::new(MetricsCollector::new());

        let tasks = TaskTracker::new();
        tasks.spawn(server.run(cancel.child_token()));
        tasks.spawn(report_stats(
            adapter.clone(),
            registry.clone(),
            metrics.clone(),
            config.stats_interval,
            cancel.child_token(),
        ));

        info!(
            rtmp = %ingest_addr,
            gateway = config.gateway.as_ref().map(|g| g.url.as_str()).unwrap_or("disabled"),
            "Bridge started"
        );

        Ok(Self {
            adapter,
            endpoint,
            relay,
            registry,
            publisher,
            publication: Arc::new(Mutex::new(None)),
            publishing: Arc::new(AtomicBool::new(false)),
            metrics,
            ingest_addr,
            cancel,
            tasks,
        })
    }

    /// Address the RTMP listener is bound to.
    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn adapter(&self) -> &Arc<IngestAdapter> {
        &self.adapter
    }

    pub fn relay(&self) -> &MediaRelay {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn gateway_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    /// Run the gateway publish flow unless a publication is already active.
    /// Returns the resulting signaling state.
    pub async fn connect_gateway(&self) -> EngineResult<SignalingState> {
        self.connect_gateway_over(None).await
    }

    /// Same as [`Self::connect_gateway`] over an already open link.
    pub async fn connect_gateway_with(&self, link: Link) -> EngineResult<SignalingState> {
        self.connect_gateway_over(Some(link)).await
    }

    /// The publish runs as a bridge task, so it finishes or rolls back even
    /// when the caller stops waiting, and [`Self::shutdown`] cancels it.
    async fn connect_gateway_over(&self, link: Option<Link>) -> EngineResult<SignalingState> {
        let publisher = self.publisher.clone().ok_or(EngineError::GatewayDisabled)?;
        let busy = BusyGuard::acquire(&self.publishing).ok_or(EngineError::GatewayBusy)?;

        let slot = self.publication.clone();
        let cancel = self.cancel.child_token();
        let handle = self.tasks.spawn(async move {
            let _busy = busy;
            publish_or_reuse(&publisher, &slot, link, &cancel).await
        });
        handle
            .await
            .map_err(|e| EngineError::PublishTask(e.to_string()))?
    }

    /// Answer a direct viewer's offer and attach it to the relay.
    #[instrument(name = "viewer_answer", skip_all)]
    pub async fn answer_viewer(&self, offer_sdp: &str) -> EngineResult<ViewerSession> {
        let (transport, answer) = self.endpoint.answer(offer_sdp).await?;
        let attachment = match self.relay.attach(&transport).await {
            Ok(attachment) => attachment,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let session = ViewerSession::new(transport, attachment, answer, self.registry.clone());
        info!(
            viewer = %session.id(),
            viewers = self.registry.viewer_count(),
            live = self.adapter.is_live(),
            "Viewer attached"
        );
        Ok(session)
    }

    pub fn status(&self) -> BridgeStatus {
        let ingest = self.adapter.statistics();
        let metrics = self.metrics.snapshot(&ingest, &self.registry.statistics());

        let gateway = self.publisher.as_ref().map(|publisher| {
            let publication = self.publication.lock();
            let state = match publication.as_ref() {
                Some(p) => p.state(),
                None => publisher.last_state(),
            };
            GatewayStatus {
                state,
                phase: publisher.phase(),
                publishing: publication.as_ref().is_some_and(|p| p.is_active()),
            }
        });

        BridgeStatus {
            publish_live: self.adapter.is_live(),
            stream_key: self.adapter.active_stream_key(),
            viewers: self.registry.viewer_count(),
            relayed_transports: self.registry.len(),
            gateway,
            ingest,
            metrics,
        }
    }

    /// Stop the background tasks and close the gateway publication.
    pub async fn shutdown(&self) {
        info!("Bridge shutting down");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let publication = self.publication.lock().take();
        if let Some(publication) = publication {
            publication.close().await;
        }
        info!("Bridge stopped");
    }
}

/// Keep an active publication, otherwise replace it with a fresh publish.
async fn publish_or_reuse(
    publisher: &GatewayPublisher,
    slot: &Mutex<Option<Publication>>,
    link: Option<Link>,
    cancel: &CancellationToken,
) -> EngineResult<SignalingState> {
    let previous = slot.lock().take();
    if let Some(publication) = previous {
        if publication.is_active() {
            debug!("Gateway publication already active");
            let state = publication.state();
            *slot.lock() = Some(publication);
            return Ok(state);
        }
        info!(state = %publication.state(), "Replacing inactive gateway publication");
        publication.close().await;
    }

    let publication = publisher.publish_until(link, cancel).await?;
    let state = publication.state();
    *slot.lock() = Some(publication);
    Ok(state)
}

/// Log stream statistics while a publish is live.
async fn report_stats(
    adapter: Arc<IngestAdapter>,
    registry: Arc<RelayRegistry>,
    metrics: Arc<MetricsCollector>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let live = adapter.is_live();
        if live && !metrics.is_running() {
            metrics.start();
        } else if !live && metrics.is_running() {
            metrics.stop();
        }
        if !live {
            continue;
        }

        let ingest = adapter.statistics();
        let snapshot = metrics.snapshot(&ingest, &registry.statistics());
        info!(
            audio_pps = snapshot.audio_packets_per_sec,
            video_pps = snapshot.video_packets_per_sec,
            bitrate_kbps = snapshot.ingest_bitrate_kbps,
            transports = snapshot.relayed_transports,
            samples = snapshot.samples_written,
            dropped = snapshot.delivery_drops,
            uptime = snapshot.uptime_seconds,
            "Stream stats"
        );
        for warning in metrics.check_warnings(&snapshot) {
            warn!(?warning, "Stream warning");
        }
        metrics.mark_reported(&ingest, &snapshot);
    }
}
