//! Wire types shared by the hub and portal clients.

use serde::{Deserialize, Serialize};

/// One entity state as reported by the hub's `/api/states` endpoint.
///
/// A read-only snapshot: one is produced per poll and never mutated.
/// All interesting metadata lives in the free-form `attributes` map,
/// so typed accessors pull out the handful of keys the agent cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity identifier, e.g. `"sensor.meter_power"` or `"camera.porch"`.
    pub entity_id: String,

    /// Raw state value as a string. May be `"unavailable"`, `"unknown"`,
    /// or empty for entities that have no current reading.
    pub state: String,

    /// Attribute map the hub sends alongside the state.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl EntityState {
    /// The entity's domain: everything before the first `.`.
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or("")
    }

    /// The `unit_of_measurement` attribute, if present.
    pub fn unit(&self) -> Option<&str> {
        self.attr_str("unit_of_measurement")
    }

    /// The `device_class` attribute, if present.
    pub fn device_class(&self) -> Option<&str> {
        self.attr_str("device_class")
    }

    /// The `friendly_name` attribute, if present.
    pub fn friendly_name(&self) -> Option<&str> {
        self.attr_str("friendly_name")
    }

    /// The `supported_features` bitmask, defaulting to 0.
    pub fn supported_features(&self) -> u64 {
        self.attributes
            .get("supported_features")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Result of invoking a named operation on the hub.
///
/// The hub responds with the list of entity states the call changed.
pub type ServiceResponse = Vec<EntityState>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accessors_read_attributes() {
        let state: EntityState = serde_json::from_value(serde_json::json!({
            "entity_id": "sensor.meter_power",
            "state": "1520.5",
            "attributes": {
                "unit_of_measurement": "W",
                "device_class": "power",
                "friendly_name": "Meter power",
            }
        }))
        .unwrap();

        assert_eq!(state.domain(), "sensor");
        assert_eq!(state.unit(), Some("W"));
        assert_eq!(state.device_class(), Some("power"));
        assert_eq!(state.friendly_name(), Some("Meter power"));
        assert_eq!(state.supported_features(), 0);
    }

    #[test]
    fn missing_attributes_default_to_empty() {
        let state: EntityState =
            serde_json::from_value(serde_json::json!({ "entity_id": "sun.sun", "state": "up" }))
                .unwrap();

        assert!(state.attributes.is_empty());
        assert_eq!(state.unit(), None);
        assert_eq!(state.device_class(), None);
    }
}
