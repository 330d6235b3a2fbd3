use std::sync::Arc;
use std::time::Duration;

use bridge_media::{IngestTrack, MediaKind};
use bridge_webrtc::sdp::SdpSummary;
use bridge_webrtc::{
    Endpoint, EndpointConfig, MediaRelay, TransportDirection, WebRtcError,
};

fn endpoint() -> Endpoint {
    Endpoint::new(EndpointConfig {
        ice_gather_timeout: Duration::from_millis(500),
        ..EndpointConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_offer_advertises_fixed_capabilities() {
    let endpoint = endpoint();
    let pending = endpoint.offer().await.unwrap();
    let summary = SdpSummary::parse(pending.sdp()).unwrap();

    let audio = summary.section("audio").unwrap();
    let opus = audio.codec("opus").unwrap();
    assert_eq!(opus.payload_type, 96);
    assert_eq!(opus.clock_rate, 48000);

    let video = summary.section("video").unwrap();
    let h264 = video.codec("H264").unwrap();
    assert_eq!(h264.payload_type, 100);
    assert_eq!(
        h264.feedback,
        endpoint.capabilities().video_feedback_lines()
    );
    assert!(h264
        .fmtp
        .as_deref()
        .unwrap()
        .contains("profile-level-id=42e01f"));

    for uri in &endpoint.capabilities().video.extensions {
        assert!(video.extensions.contains(uri), "missing extension {}", uri);
    }

    pending.abandon().await;
}

#[tokio::test]
async fn test_stream_requires_both_descriptions() {
    let endpoint = endpoint();
    let pending = endpoint.offer().await.unwrap();

    assert!(matches!(
        pending.transport().create_outgoing_stream().await,
        Err(WebRtcError::TransportNotBound)
    ));

    pending.abandon().await;
}

#[tokio::test]
async fn test_both_directions_bind() {
    let publisher = endpoint();
    let viewer = endpoint();

    let pending = publisher.offer().await.unwrap();
    let (inbound, answer) = viewer.answer(pending.sdp()).await.unwrap();
    assert_eq!(inbound.direction(), TransportDirection::InboundInitiated);
    assert!(inbound.is_bound().await);

    let outbound = pending.accept_answer(&answer).await.unwrap();
    assert_eq!(outbound.direction(), TransportDirection::OutboundInitiated);
    assert!(outbound.is_bound().await);

    let stream = outbound.create_outgoing_stream().await.unwrap();
    assert!(!stream.id().is_empty());
    assert!(matches!(
        outbound.create_outgoing_stream().await,
        Err(WebRtcError::StreamAlreadyCreated(_))
    ));

    inbound.close().await;
    outbound.close().await;
    assert!(outbound.is_closed());
}

#[tokio::test]
async fn test_offer_without_h264_is_rejected() {
    let endpoint = endpoint();
    let offer = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:96 VP8/90000\r\n";

    assert!(matches!(
        endpoint.answer(offer).await,
        Err(WebRtcError::NegotiationFailed(_))
    ));
}

#[tokio::test]
async fn test_relay_attach_and_detach() {
    let audio = Arc::new(IngestTrack::new(MediaKind::Audio));
    let video = Arc::new(IngestTrack::new(MediaKind::Video));
    let relay = MediaRelay::new(audio.clone(), video.clone());

    let publisher = endpoint();
    let viewer = endpoint();
    let pending = publisher.offer().await.unwrap();
    let (_inbound, answer) = viewer.answer(pending.sdp()).await.unwrap();
    let first = pending.accept_answer(&answer).await.unwrap();

    let pending = publisher.offer().await.unwrap();
    let (_inbound2, answer) = viewer.answer(pending.sdp()).await.unwrap();
    let second = pending.accept_answer(&answer).await.unwrap();

    let a = relay.attach(&first).await.unwrap();
    let b = relay.attach(&second).await.unwrap();
    assert_eq!(relay.active_attachments(), 2);
    assert_eq!(audio.sink_count(), 2);
    assert_eq!(video.sink_count(), 2);

    // Attaching the same transport twice would need a second stream.
    assert!(relay.attach(&first).await.is_err());

    a.detach().await;
    assert_eq!(relay.active_attachments(), 1);
    assert_eq!(audio.sink_count(), 1);
    assert_eq!(video.sink_count(), 1);
    assert!(b.is_active());

    // Closing the transport stops the remaining attachment.
    second.close().await;
    tokio::time::timeout(Duration::from_secs(1), b.stopped())
        .await
        .unwrap();
    drop(b);
    assert_eq!(audio.sink_count(), 0);
    assert_eq!(relay.active_attachments(), 0);
}
