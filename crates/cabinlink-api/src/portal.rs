// Portal HTTP client.
//
// The portal exposes function endpoints under /functions/v1/. All sync
// uploads carry the cabin identity issued at auth-code exchange; the
// tunnel queue is read with GET and resolved with PATCH.

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

// ── Wire types ───────────────────────────────────────────────────────

/// Credentials issued by the portal when an auth code is exchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    pub cabin_id: String,
    pub ha_username: String,
    pub ha_password: String,
}

/// Cabin identity attached to every sync upload.
#[derive(Debug, Clone)]
pub struct CabinCredentials {
    pub cabin_id: String,
    pub hub_username: String,
    pub hub_password: SecretString,
}

/// A remotely queued instruction awaiting local execution.
///
/// The portal is the sole owner of storage; the agent only reads pending
/// requests and writes their terminal status.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelRequest {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Terminal status written back for a tunnel request, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Completed,
    Error,
}

/// PATCH body resolving a tunnel request.
#[derive(Debug, Serialize)]
pub struct TunnelUpdate {
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelUpdate {
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: TunnelStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TunnelStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Async client for the cabinlink portal.
pub struct PortalClient {
    http: reqwest::Client,
    base_url: Url,
}

impl PortalClient {
    /// Build a portal client from the portal root URL.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self { http, base_url })
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn from_reqwest(base_url: Url, http: reqwest::Client) -> Self {
        Self { http, base_url }
    }

    /// Join a function path (e.g. `"functions/v1/electricity-sync"`).
    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = format!("{}/", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)?.join(path).map_err(Error::InvalidUrl)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        self.handle_response(resp).await
    }

    /// POST where only the status code matters; the ack body, if any,
    /// is discarded.
    async fn post_ack<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), Error> {
        let url = self.url(path)?;
        debug!("POST {url}");

        let resp = self.http.post(url).json(body).send().await?;
        self.ack(resp).await
    }

    async fn ack(&self, resp: reqwest::Response) -> Result<(), Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(self.parse_error(status, resp).await);
        }
        Ok(())
    }

    async fn handle_response<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(self.parse_error(status, resp).await);
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    }

    async fn parse_error(&self, status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
        let raw = resp.text().await.unwrap_or_default();

        let message = serde_json::from_str::<ErrorResponse>(&raw)
            .ok()
            .and_then(|e| e.message.or(e.error))
            .unwrap_or_else(|| {
                if raw.is_empty() {
                    status.to_string()
                } else {
                    raw
                }
            });

        Error::Portal {
            status: status.as_u16(),
            message,
        }
    }

    fn identity_fields(creds: &CabinCredentials) -> serde_json::Value {
        serde_json::json!({
            "cabin_id": creds.cabin_id,
            "ha_username": creds.hub_username,
            "ha_password": creds.hub_password.expose_secret(),
        })
    }

    // ━━ Public API ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Exchange a one-time auth code for cabin credentials.
    pub async fn authenticate(&self, auth_code: &SecretString) -> Result<AuthGrant, Error> {
        let body = serde_json::json!({ "auth_code": auth_code.expose_secret() });
        match self.post("functions/v1/raspberry-auth", &body).await {
            Err(Error::Portal { status: 401 | 403, message }) => {
                Err(Error::Authentication { message })
            }
            other => other,
        }
    }

    /// Upload a classified electricity record.
    ///
    /// `electricity` is the serialized metrics record; unset fields are
    /// already absent from it.
    pub async fn sync_electricity(
        &self,
        creds: &CabinCredentials,
        electricity: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut body = Self::identity_fields(creds);
        body["electricity"] = electricity.clone();
        self.post_ack("functions/v1/electricity-sync", &body).await
    }

    /// Upload the current camera roster.
    pub async fn sync_cameras<C: Serialize + Sync>(
        &self,
        creds: &CabinCredentials,
        cameras: &[C],
    ) -> Result<(), Error> {
        let mut body = Self::identity_fields(creds);
        body["cameras"] = serde_json::to_value(cameras).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;
        self.post_ack("functions/v1/camera-sync", &body).await
    }

    /// Upload a configuration backup payload.
    pub async fn sync_backup(
        &self,
        creds: &CabinCredentials,
        backup_data: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut body = Self::identity_fields(creds);
        body["backup_data"] = backup_data.clone();
        self.post_ack("functions/v1/raspberry-backup", &body).await
    }

    /// List tunnel requests still pending for this cabin, in portal order.
    pub async fn pending_requests(&self, cabin_id: &str) -> Result<Vec<TunnelRequest>, Error> {
        let url = self.url("functions/v1/tunnel-requests")?;
        debug!("GET {url}");

        let resp = self
            .http
            .get(url)
            .query(&[("cabin_id", cabin_id), ("status", "pending")])
            .send()
            .await?;
        self.handle_response(resp).await
    }

    /// Write a tunnel request's terminal status.
    pub async fn resolve_request(&self, request_id: &str, update: &TunnelUpdate) -> Result<(), Error> {
        let url = self.url(&format!("functions/v1/tunnel-requests/{request_id}"))?;
        debug!("PATCH {url}");

        let resp = self.http.patch(url).json(update).send().await?;
        self.ack(resp).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_update_serializes_only_populated_side() {
        let completed = serde_json::to_value(TunnelUpdate::completed(serde_json::json!({"ok": true})))
            .unwrap();
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["result"]["ok"], true);
        assert!(completed.get("error").is_none());

        let failed = serde_json::to_value(TunnelUpdate::error("unknown action: reboot")).unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["error"], "unknown action: reboot");
        assert!(failed.get("result").is_none());
    }

    #[test]
    fn tunnel_request_parameters_default_to_null() {
        let req: TunnelRequest =
            serde_json::from_value(serde_json::json!({ "id": "r1", "action": "ping" })).unwrap();
        assert_eq!(req.id, "r1");
        assert!(req.parameters.is_null());
    }
}
