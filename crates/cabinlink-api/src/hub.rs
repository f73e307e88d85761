// Local hub REST client.
//
// Wraps `reqwest::Client` with bearer-token auth against the hub's
// supervisor API. All calls are idempotent request/response and safe to
// issue concurrently from multiple tasks.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::model::{EntityState, ServiceResponse};
use crate::transport::TransportConfig;

/// Async client for the local hub's REST API.
///
/// The base URL is the hub root (e.g. `http://supervisor/core`); all
/// endpoints live under `/api/`. The bearer token is injected as a
/// default header on every request.
pub struct HubClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HubClient {
    /// Build a hub client with bearer-token auth.
    pub fn new(base_url: Url, token: &SecretString, transport: &TransportConfig) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| Error::InvalidHubToken)?;
        auth_value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth_value);

        let http = transport.build_client_with_headers(headers)?;
        Ok(Self { http, base_url })
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn from_reqwest(base_url: Url, http: reqwest::Client) -> Self {
        Self { http, base_url }
    }

    /// Join an API path (e.g. `"api/states"`) onto the base URL.
    fn url(&self, path: &str) -> Result<Url, Error> {
        let base = format!("{}/", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)?.join(path).map_err(Error::InvalidUrl)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path)?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        self.handle_response(resp).await
    }

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

    async fn handle_response<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidHubToken);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Hub {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            });
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

    // ━━ Public API ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Fetch the full entity-state list.
    pub async fn states(&self) -> Result<Vec<EntityState>, Error> {
        self.get("api/states").await
    }

    /// Fetch a single entity's state. 404 maps to [`Error::EntityNotFound`].
    pub async fn state(&self, entity_id: &str) -> Result<EntityState, Error> {
        match self.get(&format!("api/states/{entity_id}")).await {
            Err(Error::Hub { status: 404, .. }) => Err(Error::EntityNotFound {
                entity_id: entity_id.to_owned(),
            }),
            other => other,
        }
    }

    /// Invoke a named operation (`domain.service`) on the hub.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: &serde_json::Value,
    ) -> Result<ServiceResponse, Error> {
        self.post(&format!("api/services/{domain}/{service}"), data)
            .await
    }

    /// Fetch the latest still frame for a camera entity as raw bytes.
    pub async fn camera_image(&self, entity_id: &str) -> Result<Bytes, Error> {
        let url = self.url(&format!("api/camera_proxy/{entity_id}"))?;
        debug!("GET {url}");

        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::EntityNotFound {
                entity_id: entity_id.to_owned(),
            });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Hub {
                status: status.as_u16(),
                message,
            });
        }

        resp.bytes().await.map_err(Error::Transport)
    }
}
