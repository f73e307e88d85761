//! Camera discovery.
//!
//! Derives portal-facing camera descriptors from the hub's `camera.*`
//! entities. Descriptors are rebuilt from scratch on every sync pass;
//! the entity id is the only persistent identity.

use serde::Serialize;

use cabinlink_api::EntityState;

/// Camera feature bit signalling a live stream source.
const FEATURE_STREAM: u64 = 2;

/// Reachability of a camera as reported by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Online,
    Offline,
    Unknown,
}

impl CameraStatus {
    /// Any live state (idle, streaming, recording) counts as online.
    fn from_state(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "unavailable" => Self::Offline,
            "unknown" | "" => Self::Unknown,
            _ => Self::Online,
        }
    }
}

/// One camera as presented to the portal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraDescriptor {
    pub entity_id: String,
    pub name: String,
    pub status: CameraStatus,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub supports_stream: bool,
}

impl CameraDescriptor {
    fn from_state(state: &EntityState) -> Self {
        Self {
            entity_id: state.entity_id.clone(),
            name: state
                .friendly_name()
                .map(str::to_owned)
                .unwrap_or_else(|| state.entity_id.clone()),
            status: CameraStatus::from_state(&state.state),
            manufacturer: attr_string(state, "manufacturer"),
            model: attr_string(state, "model"),
            supports_stream: state.supported_features() & FEATURE_STREAM != 0,
        }
    }
}

fn attr_string(state: &EntityState, key: &str) -> Option<String> {
    state.attributes.get(key)?.as_str().map(str::to_owned)
}

/// Collect descriptors for every `camera.*` entity in the snapshot.
pub fn discover(states: &[EntityState]) -> Vec<CameraDescriptor> {
    states
        .iter()
        .filter(|s| s.domain() == "camera")
        .map(CameraDescriptor::from_state)
        .collect()
}
