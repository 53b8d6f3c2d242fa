mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tryst_common::Mode;

#[tokio::test]
async fn happy_text_pairing_and_relay() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("text").await;
    let waiting = x.recv().await;
    assert_eq!(waiting["type"], "waiting");

    let mut y = TestClient::connect(&addr, "y").await;
    y.join("text").await;

    let paired_x = x.recv_kind("paired").await;
    assert_eq!(paired_x["partnerId"], "y");
    assert!(
        paired_x.get("isOfferer").is_none(),
        "text pairs carry no offerer"
    );
    let paired_y = y.recv_kind("paired").await;
    assert_eq!(paired_y["partnerId"], "x");

    y.send(json!({
        "type": "text-message",
        "userId": "y",
        "targetId": "x",
        "message": "hi",
    }))
    .await;

    let delivered = x.recv_kind("text-message").await;
    assert_eq!(delivered["from"], "y");
    assert_eq!(delivered["message"], "hi");
}

#[tokio::test]
async fn video_pairing_elects_one_offerer() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("video").await;
    assert_eq!(x.recv().await["type"], "waiting");

    let mut y = TestClient::connect(&addr, "y").await;
    y.join("video").await;

    let paired_x = x.recv_kind("paired").await;
    let paired_y = y.recv_kind("paired").await;
    // x queued first and is the offerer.
    assert_eq!(paired_x["isOfferer"], true);
    assert_eq!(paired_y["isOfferer"], false);
}

#[tokio::test]
async fn self_pair_guard_holds() {
    let (addr, state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("text").await;
    assert_eq!(x.recv().await["type"], "waiting");
    x.join("text").await;
    assert_eq!(x.recv().await["type"], "waiting");

    x.expect_silence(Duration::from_millis(200)).await;
    assert_eq!(state.queue.queue_len(Mode::Text), 1);
    assert!(!state.pairing.is_paired("x"));
}

#[tokio::test]
async fn mode_switch_text_to_video() {
    let (addr, state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("text").await;
    let mut y = TestClient::connect(&addr, "y").await;
    y.join("text").await;
    let _ = x.recv_kind("paired").await;
    let _ = y.recv_kind("paired").await;

    x.send(json!({
        "type": "mode-switch-to-video",
        "userId": "x",
        "partnerId": "y",
    }))
    .await;
    x.expect_silence(Duration::from_millis(200)).await;
    y.expect_silence(Duration::from_millis(200)).await;

    y.send(json!({
        "type": "mode-switch-to-video",
        "userId": "y",
        "partnerId": "x",
    }))
    .await;

    let ready_x = x.recv_kind("video-mode-ready").await;
    assert_eq!(ready_x["isOfferer"], true);
    assert_eq!(ready_x["partnerId"], "y");
    let ready_y = y.recv_kind("video-mode-ready").await;
    assert_eq!(ready_y["isOfferer"], false);
    assert_eq!(ready_y["partnerId"], "x");

    let session = state.pairing.get_session_data("x").unwrap();
    assert_eq!(session.mode, Mode::Video);
    assert_eq!(session.switch_history.len(), 1);
    assert_eq!(session.switch_history[0].from, Mode::Text);
    assert_eq!(session.switch_history[0].to, Mode::Video);
}

#[tokio::test]
async fn disconnect_requeues_partner() {
    let (addr, state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("text").await;
    let mut y = TestClient::connect(&addr, "y").await;
    y.join("text").await;
    let _ = x.recv_kind("paired").await;
    let _ = y.recv_kind("paired").await;

    drop(x);

    assert_eq!(y.recv().await["type"], "partner-disconnected");
    assert_eq!(y.recv().await["type"], "waiting");

    let status = state.queue.is_in_queue("y").expect("y is requeued");
    assert_eq!(status.mode, Mode::Text);
    assert!(!state.pairing.is_paired("y"));
}

#[tokio::test]
async fn report_cascade_bans_and_disconnects() {
    let (addr, state) = start_server().await;
    let bad_ip = "203.0.113.9";

    let mut z = TestClient::connect_from(&addr, "z", Some(bad_ip)).await;

    for i in 0..5 {
        let mut reporter = TestClient::connect(&addr, &format!("rep{i}")).await;
        reporter
            .send(json!({
                "type": "report-user",
                "userId": format!("rep{i}"),
                "reportedId": "z",
                "reason": "abusive",
            }))
            .await;
        // Give the frame time to land before the next reporter connects.
        reporter.expect_silence(Duration::from_millis(100)).await;
    }

    z.expect_closed().await;
    assert!(state.security.is_ip_banned(bad_ip.parse().unwrap()));

    // A fresh upgrade attempt from the banned IP is rejected before the
    // handshake completes.
    let url = format!("ws://{addr}/");
    let mut req = url.into_client_request().unwrap();
    req.headers_mut()
        .insert("X-Forwarded-For", bad_ip.parse().unwrap());
    match tokio_tungstenite::connect_async(req).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 403),
        other => panic!("expected 403 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn dangerous_and_oversized_messages_are_rejected() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("text").await;
    let mut y = TestClient::connect(&addr, "y").await;
    y.join("text").await;
    let _ = x.recv_kind("paired").await;
    let _ = y.recv_kind("paired").await;

    x.send(json!({
        "type": "text-message",
        "userId": "x",
        "targetId": "y",
        "message": "hello <script>alert(1)</script>",
    }))
    .await;
    assert_eq!(x.recv().await["type"], "error");
    y.expect_silence(Duration::from_millis(200)).await;

    x.send(json!({
        "type": "text-message",
        "userId": "x",
        "targetId": "y",
        "message": "a".repeat(600),
    }))
    .await;
    assert_eq!(x.recv().await["type"], "error");
    y.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn frame_size_boundary() {
    let (addr, _state) = start_server().await;
    let mut x = TestClient::connect(&addr, "x").await;

    let shell = r#"{"type":"ping","pad":""}"#;
    let at_limit = format!(
        r#"{{"type":"ping","pad":"{}"}}"#,
        "x".repeat(10_240 - shell.len())
    );
    assert_eq!(at_limit.len(), 10_240);
    x.send_raw(at_limit).await;
    x.expect_silence(Duration::from_millis(200)).await;

    let over_limit = format!(
        r#"{{"type":"ping","pad":"{}"}}"#,
        "x".repeat(10_241 - shell.len())
    );
    assert_eq!(over_limit.len(), 10_241);
    x.send_raw(over_limit).await;
    assert_eq!(x.recv().await["type"], "error");

    // The connection survives the oversize rejection.
    x.join("text").await;
    assert_eq!(x.recv().await["type"], "waiting");
}

#[tokio::test]
async fn undecodable_json_closes_the_transport() {
    let (addr, _state) = start_server().await;
    let mut x = TestClient::connect(&addr, "x").await;

    x.send_raw("{definitely not json".into()).await;
    assert_eq!(x.recv().await["type"], "error");
    x.expect_closed().await;
}

#[tokio::test]
async fn ip_connection_rate_limit_replies_429() {
    let (addr, _state) = start_server_with(|c| c.max_connections_per_ip = 2).await;
    let ip = "198.51.100.7";

    let _a = TestClient::connect_from(&addr, "a", Some(ip)).await;
    let _b = TestClient::connect_from(&addr, "b", Some(ip)).await;

    let url = format!("ws://{addr}/");
    let mut req = url.into_client_request().unwrap();
    req.headers_mut()
        .insert("X-Forwarded-For", ip.parse().unwrap());
    match tokio_tungstenite::connect_async(req).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 429),
        other => panic!("expected 429 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_user_id_replaces_old_connection() {
    let (addr, _state) = start_server().await;

    let mut old = TestClient::connect(&addr, "dup").await;
    let mut new = TestClient::connect(&addr, "dup").await;
    old.expect_closed().await;

    // Relays reach the new connection.
    let mut peer = TestClient::connect(&addr, "peer").await;
    peer.send(json!({
        "type": "typing-start",
        "userId": "peer",
        "targetId": "dup",
    }))
    .await;
    let typing = new.recv_kind("typing-start").await;
    assert_eq!(typing["from"], "peer");
}

#[tokio::test]
async fn signaling_relay_passes_extras_through() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    x.join("video").await;
    let mut y = TestClient::connect(&addr, "y").await;
    y.join("video").await;
    let _ = x.recv_kind("paired").await;
    let _ = y.recv_kind("paired").await;

    x.send(json!({
        "type": "offer",
        "userId": "x",
        "targetId": "y",
        "offer": {"sdp": "v=0", "kind": "offer"},
        "renegotiation": true,
    }))
    .await;

    let offer = y.recv_kind("offer").await;
    assert_eq!(offer["from"], "x");
    assert_eq!(offer["offer"]["sdp"], "v=0");
    assert_eq!(offer["renegotiation"], true);

    y.send(json!({
        "type": "ice-candidate",
        "userId": "y",
        "targetId": "x",
        "candidate": {"candidate": "c0", "sdpMid": "0"},
    }))
    .await;
    let candidate = x.recv_kind("ice-candidate").await;
    assert_eq!(candidate["from"], "y");
    assert_eq!(candidate["candidate"]["sdpMid"], "0");
}

#[tokio::test]
async fn video_request_between_strangers_is_dropped() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect(&addr, "x").await;
    let mut y = TestClient::connect(&addr, "y").await;

    x.send(json!({
        "type": "video-request",
        "to": "y",
        "from": "x",
    }))
    .await;
    y.expect_silence(Duration::from_millis(200)).await;
    x.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn user_count_broadcasts_track_connections() {
    let (addr, _state) = start_server().await;

    let mut x = TestClient::connect_unidentified(&addr, None).await;
    x.send(json!({
        "type": "identify",
        "userId": "x",
        "fingerprint": "fp-x",
    }))
    .await;

    // recv() skips user-count; read raw frames here instead.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut counted = None;
    while tokio::time::Instant::now() < deadline {
        use futures_util::StreamExt;
        let Ok(Some(Ok(msg))) =
            tokio::time::timeout(Duration::from_secs(1), x.ws_rx.next()).await
        else {
            break;
        };
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "user-count" {
                counted = value["count"].as_u64();
                break;
            }
        }
    }
    assert_eq!(counted, Some(1));
}
