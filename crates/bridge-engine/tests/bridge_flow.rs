use std::sync::Arc;
use std::time::Duration;

use bridge_engine::{
    Bridge, BridgeConfig, EngineError, GatewayPublisher, RelayRegistry, ViewerMessage,
};
use bridge_ingest::IngestConfig;
use bridge_media::{IngestTrack, MediaKind};
use bridge_signaling::{GatewayConfig, Link, SignalingState};
use bridge_webrtc::{Endpoint, EndpointConfig, MediaRelay};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn endpoint_config() -> EndpointConfig {
    EndpointConfig {
        ice_gather_timeout: Duration::from_millis(500),
        ..EndpointConfig::default()
    }
}

fn bridge_config(gateway: bool) -> BridgeConfig {
    BridgeConfig {
        ingest: IngestConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            stream_key: None,
        },
        gateway: gateway.then(|| GatewayConfig {
            room: 1234,
            transaction_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(3600),
            ..GatewayConfig::default()
        }),
        endpoint: endpoint_config(),
        stats_interval: Duration::from_secs(3600),
    }
}

/// A gateway that accepts everything and answers the offer with a real
/// peer connection.
fn mock_gateway(mut link: Link, joined: bool) -> JoinHandle<Option<Arc<Endpoint>>> {
    tokio::spawn(async move {
        let remote = Arc::new(Endpoint::new(endpoint_config()).unwrap());
        let mut peers = Vec::new();

        while let Some(text) = link.recv().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            let transaction = request["transaction"].clone();
            let replies = match request["janus"].as_str().unwrap() {
                "create" => vec![json!({"janus": "success", "data": {"id": 11}})],
                "attach" => vec![json!({"janus": "success", "data": {"id": 22}})],
                "message" if request["body"]["request"] == "joinandconfigure" => {
                    let status = if joined { "joined" } else { "event" };
                    vec![
                        json!({"janus": "ack"}),
                        json!({"janus": "event", "sender": 22,
                               "plugindata": {"plugin": "janus.plugin.videoroom",
                                              "data": {"videoroom": status, "room": 1234, "id": 5}}}),
                    ]
                }
                "message" => {
                    let offer = request["jsep"]["sdp"].as_str().unwrap();
                    let (transport, answer) = remote.answer(offer).await.unwrap();
                    peers.push(transport);
                    vec![
                        json!({"janus": "ack"}),
                        json!({"janus": "event", "sender": 22,
                               "plugindata": {"plugin": "janus.plugin.videoroom",
                                              "data": {"videoroom": "event", "configured": "ok"}},
                               "jsep": {"type": "answer", "sdp": answer}}),
                    ]
                }
                _ => vec![json!({"janus": "ack"})],
            };
            for mut reply in replies {
                reply["transaction"] = transaction.clone();
                if link.send(reply.to_string()).await.is_err() {
                    return None;
                }
            }
        }
        for peer in peers {
            peer.close().await;
        }
        Some(remote)
    })
}

#[tokio::test]
async fn test_idle_status() {
    let bridge = Bridge::start(bridge_config(false), CancellationToken::new())
        .await
        .unwrap();

    let status = bridge.status();
    assert!(!status.publish_live);
    assert_eq!(status.viewers, 0);
    assert!(status.gateway.is_none());
    assert_ne!(bridge.ingest_addr().port(), 0);

    assert!(matches!(
        bridge.connect_gateway().await,
        Err(EngineError::GatewayDisabled)
    ));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["publish_live"], false);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_viewer_round_trip() {
    let bridge = Bridge::start(bridge_config(false), CancellationToken::new())
        .await
        .unwrap();
    let browser = Endpoint::new(endpoint_config()).unwrap();

    let pending = browser.offer().await.unwrap();
    let offer = ViewerMessage::Offer {
        sdp: pending.sdp().to_string(),
    }
    .to_json();

    let sdp = ViewerMessage::parse_offer(&offer).unwrap();
    let session = bridge.answer_viewer(&sdp).await.unwrap();
    assert_eq!(bridge.status().viewers, 1);
    assert_eq!(bridge.relay().active_attachments(), 1);

    let ViewerMessage::Answer { sdp: answer } = session.answer() else {
        panic!("viewer reply must be an answer");
    };
    let transport = pending.accept_answer(&answer).await.unwrap();

    // The viewer's socket closing ends the session.
    session.run_until(async {}).await;
    assert_eq!(bridge.status().viewers, 0);
    assert_eq!(bridge.relay().active_attachments(), 0);

    transport.close().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_gateway_publish_reaches_negotiated() {
    let bridge = Bridge::start(bridge_config(true), CancellationToken::new())
        .await
        .unwrap();

    let (ours, theirs) = Link::pair();
    let gateway = mock_gateway(theirs, true);

    let state = bridge.connect_gateway_with(ours).await.unwrap();
    assert_eq!(
        state,
        SignalingState::Negotiated {
            session_id: 11,
            handle_id: 22,
            room: 1234
        }
    );

    let status = bridge.status();
    let gateway_status = status.gateway.unwrap();
    assert!(gateway_status.publishing);
    assert!(gateway_status.phase.is_none());
    assert_eq!(status.relayed_transports, 1);
    assert_eq!(status.viewers, 0);

    // An active publication is reused.
    assert_eq!(bridge.connect_gateway().await.unwrap(), state);

    bridge.shutdown().await;
    assert_eq!(bridge.relay().active_attachments(), 0);
    let _ = gateway.await;
}

#[tokio::test]
async fn test_gateway_publish_failure_is_reported() {
    let bridge = Bridge::start(bridge_config(true), CancellationToken::new())
        .await
        .unwrap();

    let (ours, theirs) = Link::pair();
    let _gateway = mock_gateway(theirs, false);

    let err = bridge.connect_gateway_with(ours).await.unwrap_err();
    assert!(matches!(err, EngineError::Signaling(_)));

    let gateway_status = bridge.status().gateway.unwrap();
    assert!(gateway_status.state.is_failed());
    assert!(!gateway_status.publishing);
    assert_eq!(bridge.relay().active_attachments(), 0);

    bridge.shutdown().await;
}

/// Poll until no publish phase is reported.
async fn wait_for_idle_gateway(bridge: &Bridge) {
    for _ in 0..50 {
        if bridge.status().gateway.unwrap().phase.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway publish never settled");
}

#[tokio::test]
async fn test_abandoned_connect_still_settles() {
    let bridge = Bridge::start(bridge_config(true), CancellationToken::new())
        .await
        .unwrap();

    // A gateway that never answers.
    let (ours, _theirs) = Link::pair();
    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), bridge.connect_gateway_with(ours)).await;
    assert!(abandoned.is_err());

    // The publish keeps running without its caller.
    assert!(bridge.status().gateway.unwrap().phase.is_some());
    let (second, _second_theirs) = Link::pair();
    assert!(matches!(
        bridge.connect_gateway_with(second).await,
        Err(EngineError::GatewayBusy)
    ));

    wait_for_idle_gateway(&bridge).await;
    let gateway_status = bridge.status().gateway.unwrap();
    assert!(gateway_status.state.is_failed());
    assert!(!gateway_status.publishing);

    // The busy flag is released once the publish settles.
    let (third, third_theirs) = Link::pair();
    let gateway = mock_gateway(third_theirs, true);
    assert!(bridge.connect_gateway_with(third).await.is_ok());

    bridge.shutdown().await;
    let _ = gateway.await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_publish() {
    let bridge = Arc::new(
        Bridge::start(bridge_config(true), CancellationToken::new())
            .await
            .unwrap(),
    );

    let (ours, _theirs) = Link::pair();
    let connect = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.connect_gateway_with(ours).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    bridge.shutdown().await;
    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::PublishCancelled));

    let gateway_status = bridge.status().gateway.unwrap();
    assert!(gateway_status.phase.is_none());
    assert!(gateway_status.state.is_failed());
}

#[tokio::test]
async fn test_dropped_publish_resets_phase() {
    let audio = Arc::new(IngestTrack::new(MediaKind::Audio));
    let video = Arc::new(IngestTrack::new(MediaKind::Video));
    let publisher = GatewayPublisher::new(
        bridge_config(true).gateway.unwrap(),
        Arc::new(Endpoint::new(endpoint_config()).unwrap()),
        MediaRelay::new(audio, video),
        Arc::new(RelayRegistry::new()),
    );

    let (ours, _theirs) = Link::pair();
    let dropped =
        tokio::time::timeout(Duration::from_millis(100), publisher.publish_with(ours)).await;
    assert!(dropped.is_err());

    assert!(publisher.phase().is_none());
    assert!(publisher.last_state().is_failed());
}
