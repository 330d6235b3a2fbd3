use std::time::Duration;

use bridge_signaling::{GatewayConfig, GatewaySession, Link, SignalingError, SignalingState};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// What the mock gateway does with each request, in order.
enum Reply {
    /// Send these messages, with the request's transaction filled in.
    Send(Vec<Value>),
    /// Swallow the request.
    Silent,
}

fn config() -> GatewayConfig {
    GatewayConfig {
        room: 1234,
        attach_token: "token".to_string(),
        transaction_timeout: Duration::from_millis(300),
        keepalive_interval: Duration::from_secs(3600),
        ..GatewayConfig::default()
    }
}

/// Spawn a gateway that answers requests from `script` and returns every
/// request it received.
fn mock_gateway(mut link: Link, script: Vec<Reply>) -> JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        let mut script = script.into_iter();
        while let Some(text) = link.recv().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            let transaction = request["transaction"].as_str().unwrap().to_string();
            seen.push(request);

            match script.next() {
                Some(Reply::Send(messages)) => {
                    for mut message in messages {
                        message["transaction"] = json!(transaction);
                        link.send(message.to_string()).await.unwrap();
                    }
                }
                Some(Reply::Silent) | None => {}
            }
            if script.len() == 0 {
                break;
            }
        }
        seen
    })
}

fn happy_script() -> Vec<Reply> {
    vec![
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 1}})]),
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 2}})]),
        Reply::Send(vec![
            json!({"janus": "ack"}),
            json!({"janus": "event", "sender": 2,
                   "plugindata": {"plugin": "janus.plugin.videoroom",
                                  "data": {"videoroom": "joined", "room": 1234, "id": 77}}}),
        ]),
        Reply::Send(vec![
            json!({"janus": "ack"}),
            json!({"janus": "event", "sender": 2,
                   "plugindata": {"plugin": "janus.plugin.videoroom",
                                  "data": {"videoroom": "event", "configured": "ok"}},
                   "jsep": {"type": "answer", "sdp": "v=0..."}}),
        ]),
    ]
}

#[tokio::test]
async fn test_full_publish_flow_reaches_negotiated() {
    let (ours, theirs) = Link::pair();
    let gateway = mock_gateway(theirs, happy_script());

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();
    assert_eq!(session.create_session().await.unwrap(), 1);
    assert_eq!(session.attach_plugin().await.unwrap(), 2);
    session.join_room().await.unwrap();
    let answer = session.negotiate("v=0 offer").await.unwrap();

    assert_eq!(answer, "v=0...");
    assert_eq!(
        session.state(),
        SignalingState::Negotiated {
            session_id: 1,
            handle_id: 2,
            room: 1234
        }
    );

    let requests = gateway.await.unwrap();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0]["janus"], "create");
    assert_eq!(requests[1]["janus"], "attach");
    assert_eq!(requests[1]["session_id"], 1);
    assert_eq!(requests[1]["participant"], "token");
    assert_eq!(requests[2]["body"]["request"], "joinandconfigure");
    assert_eq!(requests[2]["body"]["ptype"], "publisher");
    assert_eq!(requests[2]["handle_id"], 2);
    assert_eq!(
        requests[3]["body"],
        json!({"request": "configure", "audio": true, "video": true, "data": false})
    );
    assert_eq!(requests[3]["jsep"]["type"], "offer");
    assert_eq!(requests[3]["jsep"]["sdp"], "v=0 offer");

    // Every request got its own transaction.
    let mut transactions: Vec<_> = requests
        .iter()
        .map(|r| r["transaction"].as_str().unwrap().to_string())
        .collect();
    transactions.sort();
    transactions.dedup();
    assert_eq!(transactions.len(), 4);
}

#[tokio::test]
async fn test_join_without_joined_status_fails() {
    let (ours, theirs) = Link::pair();
    let script = vec![
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 1}})]),
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 2}})]),
        Reply::Send(vec![
            json!({"janus": "ack"}),
            json!({"janus": "event",
                   "plugindata": {"plugin": "janus.plugin.videoroom",
                                  "data": {"videoroom": "error"}}}),
        ]),
    ];
    let _gateway = mock_gateway(theirs, script);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();
    session.create_session().await.unwrap();
    session.attach_plugin().await.unwrap();

    let err = session.join_room().await.unwrap_err();
    assert!(matches!(err, SignalingError::NegotiationFailed(_)));
    assert!(session.state().is_failed());

    // A failed session does not move on.
    assert!(matches!(
        session.negotiate("v=0").await,
        Err(SignalingError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_ack_alone_is_not_a_join() {
    let (ours, theirs) = Link::pair();
    let script = vec![
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 1}})]),
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 2}})]),
        Reply::Send(vec![json!({"janus": "ack"})]),
    ];
    let _gateway = mock_gateway(theirs, script);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();
    session.create_session().await.unwrap();
    session.attach_plugin().await.unwrap();

    let err = session.join_room().await.unwrap_err();
    assert!(matches!(err, SignalingError::Timeout { .. }));
    assert!(session.state().is_failed());
}

#[tokio::test]
async fn test_zero_session_id_halts() {
    let (ours, theirs) = Link::pair();
    let script = vec![Reply::Send(vec![json!({"janus": "success", "data": {"id": 0}})])];
    let _gateway = mock_gateway(theirs, script);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();

    let err = session.create_session().await.unwrap_err();
    assert!(matches!(err, SignalingError::ProtocolViolation(_)));
    assert!(session.state().is_failed());
}

#[tokio::test]
async fn test_silent_gateway_times_out() {
    let (ours, theirs) = Link::pair();
    let _gateway = mock_gateway(theirs, vec![Reply::Silent, Reply::Silent]);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();

    let err = session.create_session().await.unwrap_err();
    assert!(matches!(err, SignalingError::Timeout { .. }));
}

#[tokio::test]
async fn test_gateway_error_reply() {
    let (ours, theirs) = Link::pair();
    let script = vec![Reply::Send(vec![
        json!({"janus": "error", "error": {"code": 403, "reason": "Unauthorized request"}}),
    ])];
    let _gateway = mock_gateway(theirs, script);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();

    match session.create_session().await {
        Err(SignalingError::Gateway { code, reason }) => {
            assert_eq!(code, 403);
            assert_eq!(reason, "Unauthorized request");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_link_drop_is_connection_lost() {
    let (ours, theirs) = Link::pair();
    drop(theirs);

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();

    let err = session.create_session().await.unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_keepalive_follows_session_creation() {
    let (ours, theirs) = Link::pair();
    let script = vec![
        Reply::Send(vec![json!({"janus": "success", "data": {"id": 9}})]),
        Reply::Send(vec![json!({"janus": "ack"})]),
        Reply::Send(vec![json!({"janus": "ack"})]),
    ];
    let gateway = mock_gateway(theirs, script);

    let mut session = GatewaySession::new(GatewayConfig {
        keepalive_interval: Duration::from_millis(50),
        ..config()
    });
    session.connect_with(ours).unwrap();
    assert_eq!(session.create_session().await.unwrap(), 9);

    let seen = tokio::time::timeout(Duration::from_secs(2), gateway)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.len(), 3);
    for keepalive in &seen[1..] {
        assert_eq!(keepalive["janus"], "keepalive");
        assert_eq!(keepalive["session_id"], 9);
    }
}

#[tokio::test]
async fn test_repeated_acks_do_not_extend_timeout() {
    let (ours, mut theirs) = Link::pair();
    let gateway = tokio::spawn(async move {
        let mut next_id = 1;
        while let Some(text) = theirs.recv().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            let transaction = request["transaction"].clone();
            if request["janus"] != "message" {
                let reply = json!({"janus": "success", "data": {"id": next_id},
                                   "transaction": transaction});
                next_id += 1;
                theirs.send(reply.to_string()).await.unwrap();
                continue;
            }
            // Keep acknowledging the join without ever settling it.
            for _ in 0..20 {
                let ack = json!({"janus": "ack", "transaction": transaction});
                if theirs.send(ack.to_string()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });

    let mut session = GatewaySession::new(config());
    session.connect_with(ours).unwrap();
    session.create_session().await.unwrap();
    session.attach_plugin().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = session.join_room().await.unwrap_err();
    match err {
        SignalingError::Timeout { after, .. } => assert_eq!(after, Duration::from_millis(300)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(session.state().is_failed());

    gateway.abort();
}
