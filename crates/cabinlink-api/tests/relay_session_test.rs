// Integration tests for `RelaySession` against an in-process WebSocket
// peer (the "portal" side) and a wiremock hub serving camera frames.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cabinlink_api::transport::TransportConfig;
use cabinlink_api::{HubClient, RelayConfig, RelaySession, SessionState};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

async fn hub_with_frames() -> (MockServer, Arc<HubClient>) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/camera_proxy/camera.porch"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .mount(&server)
        .await;

    let base: Url = server.uri().parse().unwrap();
    let hub = Arc::new(HubClient::new(
        base,
        &SecretString::from("hub-token".to_owned()),
        &TransportConfig::default(),
    )
    .unwrap());
    (server, hub)
}

fn fast_config(endpoint: Url) -> RelayConfig {
    let mut config = RelayConfig::new(
        endpoint,
        "cabin-42".into(),
        "camera.porch".into(),
        SecretString::from("tok".to_owned()),
    );
    config.frame_interval = Duration::from_millis(20);
    config.keepalive_interval = Duration::from_secs(60); // out of the way
    config.reconnect_delay = Duration::from_millis(50);
    config
}

async fn accept_peer(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, tokio_tungstenite::accept_async(stream))
        .await
        .unwrap()
        .unwrap()
}

/// Read from the peer until `n` binary frames have arrived.
async fn collect_frames(peer: &mut WebSocketStream<TcpStream>, n: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while frames.len() < n {
        let msg = timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = msg {
            frames.push(data.to_vec());
        }
    }
    frames
}

async fn wait_state(
    rx: &mut tokio::sync::watch::Receiver<SessionState>,
    expected: SessionState,
) {
    timeout(WAIT, rx.wait_for(|s| *s == expected))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn start_command_begins_frame_delivery() {
    let (_hub_server, hub) = hub_with_frames().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint: Url = format!("ws://{}", listener.local_addr().unwrap())
        .parse()
        .unwrap();

    let cancel = CancellationToken::new();
    let session = RelaySession::spawn(fast_config(endpoint), hub, &cancel);
    let mut state = session.state();

    let mut peer = accept_peer(&listener).await;
    wait_state(&mut state, SessionState::AwaitingCommand).await;

    // Noise while awaiting must be ignored, not treated as an error.
    peer.send(Message::text(r#"{"type":"mystery"}"#)).await.unwrap();
    peer.send(Message::text("not json")).await.unwrap();

    peer.send(Message::text(r#"{"type":"start_stream"}"#))
        .await
        .unwrap();
    wait_state(&mut state, SessionState::Streaming).await;

    let frames = collect_frames(&mut peer, 3).await;
    assert!(frames.iter().all(|f| f == &vec![0xFF, 0xD8, 0xFF]));
    assert!(session.frames_sent() >= 3);

    session.stop().await;
}

#[tokio::test]
async fn stop_command_returns_to_awaiting() {
    let (_hub_server, hub) = hub_with_frames().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint: Url = format!("ws://{}", listener.local_addr().unwrap())
        .parse()
        .unwrap();

    let cancel = CancellationToken::new();
    let session = RelaySession::spawn(fast_config(endpoint), hub, &cancel);
    let mut state = session.state();

    let mut peer = accept_peer(&listener).await;
    wait_state(&mut state, SessionState::AwaitingCommand).await;

    peer.send(Message::text(r#"{"type":"start_stream"}"#))
        .await
        .unwrap();
    wait_state(&mut state, SessionState::Streaming).await;
    collect_frames(&mut peer, 1).await;

    peer.send(Message::text(r#"{"type":"stop_stream"}"#))
        .await
        .unwrap();
    wait_state(&mut state, SessionState::AwaitingCommand).await;

    session.stop().await;
}

#[tokio::test]
async fn transport_close_reconnects_without_duplicate_frames() {
    let (_hub_server, hub) = hub_with_frames().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint: Url = format!("ws://{}", listener.local_addr().unwrap())
        .parse()
        .unwrap();

    let cancel = CancellationToken::new();
    let session = RelaySession::spawn(fast_config(endpoint), hub, &cancel);
    let mut state = session.state();

    // First connection: stream a couple of frames, then drop the socket.
    let mut peer = accept_peer(&listener).await;
    wait_state(&mut state, SessionState::AwaitingCommand).await;
    peer.send(Message::text(r#"{"type":"start_stream"}"#))
        .await
        .unwrap();
    collect_frames(&mut peer, 2).await;
    drop(peer);

    wait_state(&mut state, SessionState::Disconnected).await;
    let sent_before_drop = session.frames_sent();

    // The session reconnects after the fixed delay and waits for a fresh
    // start command; no frames flow until it arrives.
    let mut peer = accept_peer(&listener).await;
    wait_state(&mut state, SessionState::AwaitingCommand).await;
    assert_eq!(session.frames_sent(), sent_before_drop);

    peer.send(Message::text(r#"{"type":"start_stream"}"#))
        .await
        .unwrap();
    collect_frames(&mut peer, 2).await;
    assert!(session.frames_sent() > sent_before_drop);

    session.stop().await;
}

#[tokio::test]
async fn stop_releases_connection() {
    let (_hub_server, hub) = hub_with_frames().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint: Url = format!("ws://{}", listener.local_addr().unwrap())
        .parse()
        .unwrap();

    let cancel = CancellationToken::new();
    let session = RelaySession::spawn(fast_config(endpoint), hub, &cancel);
    let mut state = session.state();

    let mut peer = accept_peer(&listener).await;
    wait_state(&mut state, SessionState::AwaitingCommand).await;

    session.stop().await;

    // The peer observes a close frame or EOF, never a hang.
    let msg = timeout(WAIT, peer.next()).await.unwrap();
    match msg {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close, got {other:?}"),
    }
}
