//! Camera relay WebSocket session.
//!
//! Each session owns one persistent outbound connection to the portal's
//! relay endpoint for one camera. The remote viewer drives the session
//! with JSON control messages; frames flow back as binary payloads.
//!
//! State machine per connection:
//!
//! ```text
//! Disconnected → Connecting → AwaitingCommand → Streaming
//!        ↑__________________________________________|
//! ```
//!
//! Any transport error or close drops back to `Disconnected`, waits a
//! fixed reconnect delay, and tries again. The delay is constant, not
//! exponential -- the portal is expected to always eventually recover,
//! and a camera that backs off into minutes-long gaps is useless.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::hub::HubClient;

// ── Session state ────────────────────────────────────────────────────

/// Observable connection state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingCommand,
    Streaming,
}

// ── Configuration ────────────────────────────────────────────────────

/// Routing and cadence parameters for one relay session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay endpoint root, e.g. `wss://portal.example/functions/v1/camera-relay`.
    pub endpoint: Url,
    /// Cabin identity carried in the connection URI.
    pub cabin_id: String,
    /// Camera entity this session streams.
    pub camera_id: String,
    /// Portal-issued token for the relay handshake.
    pub token: SecretString,
    /// Target frame cadence. Default 10 fps.
    pub frame_interval: Duration,
    /// Keepalive cadence, independent of frames. Default 15s.
    pub keepalive_interval: Duration,
    /// Fixed delay between reconnect attempts. Default 5s.
    pub reconnect_delay: Duration,
    /// Bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl RelayConfig {
    pub fn new(endpoint: Url, cabin_id: String, camera_id: String, token: SecretString) -> Self {
        Self {
            endpoint,
            cabin_id,
            camera_id,
            token,
            frame_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// The full connection URI with routing parameters attached.
    fn connection_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("role", "agent")
            .append_pair("cabin_id", &self.cabin_id)
            .append_pair("camera", &self.camera_id)
            .append_pair("token", self.token.expose_secret());
        url
    }
}

// ── Control messages ─────────────────────────────────────────────────

/// Control message from the remote viewer. Anything that does not parse
/// into this shape is ignored, not an error.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
}

const KEEPALIVE_PAYLOAD: &str = r#"{"type":"keepalive"}"#;

// ── Handle ───────────────────────────────────────────────────────────

/// Handle to a running relay session.
///
/// The background task keeps reconnecting until [`stop`](Self::stop) is
/// called; stopping closes the connection and releases the session.
pub struct RelaySession {
    camera_id: String,
    state_rx: watch::Receiver<SessionState>,
    frames_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl RelaySession {
    /// Spawn the session's connection loop.
    pub fn spawn(config: RelayConfig, hub: Arc<HubClient>, parent_cancel: &CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let frames_sent = Arc::new(AtomicU64::new(0));
        let cancel = parent_cancel.child_token();

        let camera_id = config.camera_id.clone();
        let task_cancel = cancel.clone();
        let task_frames = Arc::clone(&frames_sent);
        let task = tokio::spawn(async move {
            session_loop(config, hub, state_tx, task_frames, task_cancel).await;
        });

        Self {
            camera_id,
            state_rx,
            frames_sent,
            cancel,
            task,
        }
    }

    /// The camera entity this session serves.
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Total binary frames forwarded since the session was spawned.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Signal the session to stop and wait for it to release its connection.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

// ── Connection loop ──────────────────────────────────────────────────

/// Outer loop: connect → serve → on any drop, fixed-delay reconnect.
async fn session_loop(
    config: RelayConfig,
    hub: Arc<HubClient>,
    state_tx: watch::Sender<SessionState>,
    frames_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let _ = state_tx.send(SessionState::Connecting);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = serve_connection(&config, &hub, &state_tx, &frames_sent, &cancel) => {
                match result {
                    Ok(()) => {
                        info!(camera = %config.camera_id, "relay disconnected cleanly");
                    }
                    Err(e) => {
                        warn!(camera = %config.camera_id, error = %e, "relay connection dropped");
                    }
                }
            }
        }

        let _ = state_tx.send(SessionState::Disconnected);

        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    let _ = state_tx.send(SessionState::Disconnected);
    debug!(camera = %config.camera_id, "relay session loop exiting");
}

/// One connection lifetime: handshake, await the start command, stream.
async fn serve_connection(
    config: &RelayConfig,
    hub: &HubClient,
    state_tx: &watch::Sender<SessionState>,
    frames_sent: &AtomicU64,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let url = config.connection_url();
    debug!(camera = %config.camera_id, "connecting to relay");

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (ws, _response) = timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| Error::RelayConnect("handshake timed out".into()))?
        .map_err(|e| Error::RelayConnect(e.to_string()))?;

    info!(camera = %config.camera_id, "relay connected, awaiting command");
    let _ = state_tx.send(SessionState::AwaitingCommand);

    let (mut write, mut read) = ws.split();

    let mut frame_tick = tokio::time::interval(config.frame_interval);
    frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut keepalive_tick = tokio::time::interval(config.keepalive_interval);
    keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive_tick.tick().await; // consume the immediate first tick

    let mut streaming = false;
    let mut last_keepalive: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(msg) if msg.kind == "start_stream" && !streaming => {
                                info!(camera = %config.camera_id, "stream start requested");
                                streaming = true;
                                frame_tick.reset_immediately();
                                let _ = state_tx.send(SessionState::Streaming);
                            }
                            Ok(msg) if msg.kind == "stop_stream" && streaming => {
                                info!(camera = %config.camera_id, "stream stop requested");
                                streaming = false;
                                let _ = state_tx.send(SessionState::AwaitingCommand);
                            }
                            // Unknown or out-of-order control messages are
                            // protocol desync, tolerated by design contract.
                            _ => debug!(camera = %config.camera_id, %text, "ignoring control message"),
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite replies with pong automatically
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(camera = %config.camera_id, ?frame, "relay close frame");
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        // Binary or pong from the peer -- nothing for us
                    }
                    Some(Err(e)) => {
                        return Err(Error::RelayClosed { reason: e.to_string() });
                    }
                    None => return Ok(()),
                }
            }

            _ = keepalive_tick.tick() => {
                write
                    .send(Message::text(KEEPALIVE_PAYLOAD))
                    .await
                    .map_err(|e| Error::RelayClosed { reason: e.to_string() })?;
                last_keepalive = Some(Instant::now());
                debug!(camera = %config.camera_id, ?last_keepalive, "keepalive sent");
            }

            _ = frame_tick.tick(), if streaming => {
                // A slow or failing frame fetch skips the tick; it never
                // terminates the session.
                match timeout(config.frame_interval * 5, hub.camera_image(&config.camera_id)).await {
                    Ok(Ok(bytes)) => {
                        write
                            .send(Message::binary(bytes))
                            .await
                            .map_err(|e| Error::RelayClosed { reason: e.to_string() })?;
                        frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        debug!(camera = %config.camera_id, error = %e, "frame fetch failed, skipping");
                    }
                    Err(_) => {
                        debug!(camera = %config.camera_id, "frame fetch timed out, skipping");
                    }
                }
            }
        }
    }
}
