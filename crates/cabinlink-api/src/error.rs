use thiserror::Error;

/// Top-level error type for the `cabinlink-api` crate.
///
/// Covers every failure mode across all wire surfaces: portal
/// authentication, HTTP transport, the local hub API, and the relay
/// WebSocket. `cabinlink-core` maps these into agent-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Portal rejected the auth code or cabin credentials.
    #[error("Portal authentication failed: {message}")]
    Authentication { message: String },

    /// The hub rejected the supervisor bearer token.
    #[error("Hub rejected bearer token")]
    InvalidHubToken,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Portal API ──────────────────────────────────────────────────
    /// Structured error from a portal function endpoint.
    #[error("Portal error (HTTP {status}): {message}")]
    Portal { message: String, status: u16 },

    // ── Hub API ─────────────────────────────────────────────────────
    /// Non-success response from the hub REST API.
    #[error("Hub error (HTTP {status}): {message}")]
    Hub { message: String, status: u16 },

    /// Entity does not exist on the hub.
    #[error("Entity not found: {entity_id}")]
    EntityNotFound { entity_id: String },

    // ── Relay ───────────────────────────────────────────────────────
    /// Relay WebSocket connection failed.
    #[error("Relay connection failed: {0}")]
    RelayConnect(String),

    /// Relay WebSocket closed unexpectedly.
    #[error("Relay closed: {reason}")]
    RelayClosed { reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the portal session is no
    /// longer valid and a credential refresh might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Portal { status: 401 | 403, .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying
    /// on the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::RelayConnect(_) | Self::RelayClosed { .. } => true,
            Self::Portal { status, .. } | Self::Hub { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::EntityNotFound { .. } => true,
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Hub { status: 404, .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_expiry_covers_portal_401_and_403() {
        assert!(
            Error::Portal {
                message: "jwt expired".into(),
                status: 401
            }
            .is_auth_expired()
        );
        assert!(
            Error::Portal {
                message: "forbidden".into(),
                status: 403
            }
            .is_auth_expired()
        );
        assert!(
            !Error::Portal {
                message: "boom".into(),
                status: 500
            }
            .is_auth_expired()
        );
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(
            Error::Hub {
                message: "upstream".into(),
                status: 502
            }
            .is_transient()
        );
        assert!(
            !Error::Hub {
                message: "bad request".into(),
                status: 400
            }
            .is_transient()
        );
        assert!(Error::Timeout { timeout_secs: 30 }.is_transient());
    }
}
