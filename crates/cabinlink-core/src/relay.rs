//! Relay session management.
//!
//! One [`RelaySession`] per stream-capable camera, tracked in a locked
//! map so the camera sync pass and shutdown can safely start and stop
//! sessions concurrently. Sessions run independently; a reconnect storm
//! on one camera never touches another's connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use cabinlink_api::{HubClient, RelayConfig, RelaySession};

use crate::cameras::CameraDescriptor;
use crate::error::AgentError;
use crate::session::SessionStore;

pub struct RelayManager {
    endpoint: Url,
    hub: Arc<HubClient>,
    session: Arc<SessionStore>,
    cancel: CancellationToken,
    sessions: Mutex<HashMap<String, RelaySession>>,
}

impl RelayManager {
    pub fn new(
        endpoint: Url,
        hub: Arc<HubClient>,
        session: Arc<SessionStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self { endpoint, hub, session, cancel, sessions: Mutex::new(HashMap::new()) }
    }

    /// Align running sessions with the latest camera snapshot: spawn one
    /// for each newly seen stream-capable camera, stop those whose camera
    /// disappeared or lost stream support. Existing sessions are left
    /// untouched so their connection state survives the sync pass.
    pub async fn reconcile(&self, cameras: &[CameraDescriptor]) -> Result<(), AgentError> {
        let portal_session = self.session.current()?;
        let mut sessions = self.sessions.lock().await;

        let desired: HashSet<&str> = cameras
            .iter()
            .filter(|c| c.supports_stream)
            .map(|c| c.entity_id.as_str())
            .collect();

        let stale: Vec<String> = sessions
            .keys()
            .filter(|id| !desired.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(session) = sessions.remove(&id) {
                info!(camera = %id, "stopping relay session");
                session.stop().await;
            }
        }

        for camera in cameras.iter().filter(|c| c.supports_stream) {
            if sessions.contains_key(&camera.entity_id) {
                continue;
            }
            info!(camera = %camera.entity_id, "starting relay session");
            let config = RelayConfig::new(
                self.endpoint.clone(),
                portal_session.cabin_id.clone(),
                camera.entity_id.clone(),
                portal_session.hub_password.clone(),
            );
            sessions.insert(
                camera.entity_id.clone(),
                RelaySession::spawn(config, Arc::clone(&self.hub), &self.cancel),
            );
        }

        Ok(())
    }

    /// Camera ids with a live session, sorted for stable output.
    pub async fn active(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every session and wait for each to release its connection.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (id, session) in sessions.drain() {
            info!(camera = %id, "stopping relay session");
            session.stop().await;
        }
    }
}

impl std::fmt::Debug for RelayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager").field("endpoint", &self.endpoint.as_str()).finish()
    }
}
