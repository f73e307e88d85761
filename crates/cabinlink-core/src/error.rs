// ── Agent error types ──
//
// Operator-facing errors from cabinlink-core. Consumers never see raw
// HTTP status codes or JSON parse failures; the `From<cabinlink_api::Error>`
// impl translates transport-layer errors into domain variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum AgentError {
    // ── Session errors ───────────────────────────────────────────────
    #[error("Portal authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("No portal session: {reason}")]
    NoSession { reason: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Endpoint unreachable: {message}")]
    Unreachable { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Entity not found: {entity_id}")]
    EntityNotFound { entity_id: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Sync rejected by portal: {message}")]
    SyncRejected { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] cabinlink_config::ConfigError),

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api { message: String },
}

impl AgentError {
    /// Whether retrying on the next cycle is the right response.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// Whether a portal session refresh might resolve this.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<cabinlink_api::Error> for AgentError {
    fn from(err: cabinlink_api::Error) -> Self {
        use cabinlink_api::Error as Api;

        match err {
            Api::Authentication { message } => Self::AuthenticationFailed { message },
            Api::InvalidHubToken => Self::AuthenticationFailed {
                message: "hub rejected bearer token".into(),
            },
            e if e.is_auth_expired() => Self::AuthenticationFailed {
                message: e.to_string(),
            },
            Api::EntityNotFound { entity_id } => Self::EntityNotFound { entity_id },
            Api::Timeout { timeout_secs } => Self::Timeout { timeout_secs },
            Api::Transport(ref e) if e.is_timeout() => Self::Timeout { timeout_secs: 0 },
            e if e.is_transient() => Self::Unreachable {
                message: e.to_string(),
            },
            e => Self::Api {
                message: e.to_string(),
            },
        }
    }
}
