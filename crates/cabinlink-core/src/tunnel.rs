//! Remote command tunnel.
//!
//! The portal cannot reach the cabin directly, so inbound RPC is modeled
//! as a poll-based work queue: the portal stores pending requests, the
//! dispatcher pulls them, executes each against the hub, and writes one
//! terminal status back per request id. Delivery is at-least-once on the
//! portal side; the dispatcher's contract is exactly one terminal write
//! per request it observes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cabinlink_api::{HubClient, PortalClient, TunnelRequest, TunnelUpdate};

use crate::error::AgentError;
use crate::session::SessionStore;

/// Actions the tunnel will execute. Anything else is answered with an
/// `error` status naming the unknown action.
const SUPPORTED_ACTIONS: &[&str] =
    &["ping", "list_entities", "get_state", "get_states", "call_service"];

/// Polls the portal's request queue and executes commands against the hub.
pub struct TunnelDispatcher {
    portal: Arc<PortalClient>,
    hub: Arc<HubClient>,
    session: Arc<SessionStore>,
    poll_interval: Duration,
}

impl TunnelDispatcher {
    pub fn new(
        portal: Arc<PortalClient>,
        hub: Arc<HubClient>,
        session: Arc<SessionStore>,
        poll_interval: Duration,
    ) -> Self {
        Self { portal, hub, session, poll_interval }
    }

    /// Poll until cancelled. A failed cycle is logged and skipped; the
    /// next tick starts fresh. Cycles never overlap.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("tunnel dispatcher stopping");
                    return;
                }
                _ = tick.tick() => {}
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(handled) => info!(handled, "resolved tunnel requests"),
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "portal unreachable, skipping tunnel cycle");
                }
                Err(err) => warn!(error = %err, "tunnel cycle failed"),
            }
        }
    }

    /// One poll cycle: list pending requests, execute each in order, and
    /// write its terminal status. A request's failure is captured in its
    /// own `error` status and never stops the rest of the batch.
    pub async fn poll_once(&self) -> Result<usize, AgentError> {
        let session = self.session.current()?;
        let requests = self.portal.pending_requests(&session.cabin_id).await?;

        let mut handled = 0;
        for request in &requests {
            let update = self.execute(request).await;
            match self.portal.resolve_request(&request.id, &update).await {
                Ok(()) => handled += 1,
                // Left pending remotely; the next cycle re-delivers it.
                Err(err) => warn!(id = %request.id, error = %err, "failed to resolve request"),
            }
        }
        Ok(handled)
    }

    /// Execute one request. Infallible by construction: every outcome,
    /// including an unknown action, becomes a terminal update.
    async fn execute(&self, request: &TunnelRequest) -> TunnelUpdate {
        debug!(id = %request.id, action = %request.action, "executing tunnel request");
        let outcome = match request.action.as_str() {
            "ping" => Ok(json!({ "status": "ok", "agent": env!("CARGO_PKG_VERSION") })),
            "list_entities" => self.list_entities(&request.parameters).await,
            "get_state" => self.get_state(&request.parameters).await,
            "get_states" => self.get_states().await,
            "call_service" => self.call_service(&request.parameters).await,
            other => Err(format!(
                "unsupported action {other:?}, expected one of {SUPPORTED_ACTIONS:?}"
            )),
        };

        match outcome {
            Ok(result) => TunnelUpdate::completed(result),
            Err(message) => TunnelUpdate::error(message),
        }
    }

    async fn list_entities(&self, params: &Value) -> Result<Value, String> {
        let domain = optional_str(params, "domain");
        let device_class = optional_str(params, "device_class");

        let states = self.hub.states().await.map_err(|e| e.to_string())?;
        let entities: Vec<Value> = states
            .iter()
            .filter(|s| domain.is_none_or(|d| s.domain() == d))
            .filter(|s| device_class.is_none_or(|dc| s.device_class() == Some(dc)))
            .map(|s| {
                json!({
                    "entity_id": s.entity_id,
                    "state": s.state,
                    "friendly_name": s.friendly_name(),
                })
            })
            .collect();

        Ok(json!({ "count": entities.len(), "entities": entities }))
    }

    async fn get_state(&self, params: &Value) -> Result<Value, String> {
        let entity_id = required_str(params, "entity_id")?;
        let state = self.hub.state(entity_id).await.map_err(|e| e.to_string())?;
        serde_json::to_value(state).map_err(|e| e.to_string())
    }

    async fn get_states(&self) -> Result<Value, String> {
        let states = self.hub.states().await.map_err(|e| e.to_string())?;
        serde_json::to_value(states).map_err(|e| e.to_string())
    }

    async fn call_service(&self, params: &Value) -> Result<Value, String> {
        let domain = required_str(params, "domain")?;
        let service = required_str(params, "service")?;
        let data = params.get("data").cloned().unwrap_or_else(|| json!({}));

        let response = self
            .hub
            .call_service(domain, service, &data)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(response).map_err(|e| e.to_string())
    }
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    optional_str(params, key).ok_or_else(|| format!("missing required parameter {key:?}"))
}
