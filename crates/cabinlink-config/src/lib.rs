//! Agent configuration and credential persistence.
//!
//! Static options come from a TOML file merged with `CABINLINK_*`
//! environment variables. The portal credentials acquired at auth-code
//! exchange are persisted as JSON so the agent survives restarts without
//! burning another auth code.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Static agent options, recognized keys only.
///
/// Everything here is read once at startup; the agent never writes it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Options {
    /// Portal root URL.
    pub portal_url: Url,

    /// One-time auth code used when no persisted credentials exist.
    pub auth_code: Option<String>,

    /// Local hub root URL.
    #[serde(default = "default_hub_url")]
    pub hub_url: Url,

    /// Environment variable holding the hub bearer token.
    #[serde(default = "default_hub_token_env")]
    pub hub_token_env: String,

    /// Hub configuration directory, read for backup sync.
    #[serde(default = "default_hub_config_dir")]
    pub hub_config_dir: PathBuf,

    /// Where portal credentials are persisted.
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,

    /// Relay endpoint override. Derived from `portal_url` when absent.
    pub relay_endpoint: Option<Url>,

    /// Accept the hub's self-signed TLS certificate.
    #[serde(default)]
    pub insecure_hub_tls: bool,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub sync: SyncIntervals,

    #[serde(default)]
    pub enable: EnableFlags,
}

/// Per-component sync cadence in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncIntervals {
    #[serde(default = "default_electricity_interval")]
    pub electricity: u64,
    #[serde(default = "default_camera_interval")]
    pub camera: u64,
    #[serde(default = "default_backup_interval")]
    pub backup: u64,
    #[serde(default = "default_tunnel_interval")]
    pub tunnel_poll: u64,
}

impl Default for SyncIntervals {
    fn default() -> Self {
        Self {
            electricity: default_electricity_interval(),
            camera: default_camera_interval(),
            backup: default_backup_interval(),
            tunnel_poll: default_tunnel_interval(),
        }
    }
}

/// Component enable flags. Everything defaults to on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnableFlags {
    #[serde(default = "default_true")]
    pub electricity: bool,
    #[serde(default = "default_true")]
    pub cameras: bool,
    #[serde(default = "default_true")]
    pub backup: bool,
    #[serde(default = "default_true")]
    pub tunnel: bool,
    #[serde(default = "default_true")]
    pub relay: bool,
}

impl Default for EnableFlags {
    fn default() -> Self {
        Self {
            electricity: true,
            cameras: true,
            backup: true,
            tunnel: true,
            relay: true,
        }
    }
}

fn default_hub_url() -> Url {
    "http://supervisor/core".parse().expect("static URL")
}
fn default_hub_token_env() -> String {
    "SUPERVISOR_TOKEN".into()
}
fn default_hub_config_dir() -> PathBuf {
    PathBuf::from("/config")
}
fn default_credentials_file() -> PathBuf {
    PathBuf::from("/data/cabinlink_credentials.json")
}
fn default_timeout() -> u64 {
    30
}
fn default_electricity_interval() -> u64 {
    60
}
fn default_camera_interval() -> u64 {
    300
}
fn default_backup_interval() -> u64 {
    3600
}
fn default_tunnel_interval() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl Options {
    /// The relay endpoint: explicit override, or derived from the portal
    /// URL (`https://…` ⇒ `wss://…/functions/v1/camera-relay`).
    pub fn relay_endpoint(&self) -> Result<Url, ConfigError> {
        if let Some(ref url) = self.relay_endpoint {
            return Ok(url.clone());
        }

        let mut url = self.portal_url.clone();
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ConfigError::Validation {
                    field: "portal_url".into(),
                    reason: format!("cannot derive relay endpoint from scheme '{other}'"),
                });
            }
        };
        url.set_scheme(scheme).map_err(|()| ConfigError::Validation {
            field: "portal_url".into(),
            reason: "cannot rewrite scheme".into(),
        })?;
        let path = format!(
            "{}/functions/v1/camera-relay",
            url.path().trim_end_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// Resolve the default options file path via XDG / platform conventions.
pub fn options_path() -> PathBuf {
    ProjectDirs::from("io", "cabinlink", "cabinlink").map_or_else(
        || PathBuf::from("/data/options.toml"),
        |dirs| dirs.config_dir().join("options.toml"),
    )
}

/// Load options from the given TOML file merged with `CABINLINK_*` env vars.
///
/// Nested keys use a double underscore: `CABINLINK_SYNC__ELECTRICITY=30`.
pub fn load_options(path: &Path) -> Result<Options, ConfigError> {
    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("CABINLINK_").split("__"));

    let options: Options = figment.extract()?;
    Ok(options)
}

// ── Credential persistence ──────────────────────────────────────────

/// Portal credentials persisted between restarts.
///
/// Written after a successful auth-code exchange and loaded on startup
/// so restarting the agent does not require a fresh code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub cabin_id: String,
    pub ha_username: String,
    /// Kept wrapped in memory; exposed only when writing the file.
    #[serde(serialize_with = "expose_for_persistence")]
    pub ha_password: SecretString,
    pub portal_url: Url,
    pub saved_at: DateTime<Utc>,
}

fn expose_for_persistence<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

impl StoredCredentials {
    /// Load persisted credentials, `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist credentials, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(path = %path.display(), cabin_id = %self.cabin_id, "credentials saved");
        Ok(())
    }

    /// Remove the persisted file, ignoring a missing one.
    pub fn delete(path: &Path) -> Result<(), ConfigError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_options(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("options.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_options_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_options(&dir, "portal_url = \"https://portal.example\"\n");

        let opts = load_options(&path).unwrap();
        assert_eq!(opts.hub_url.as_str(), "http://supervisor/core");
        assert_eq!(opts.hub_token_env, "SUPERVISOR_TOKEN");
        assert_eq!(opts.sync.electricity, 60);
        assert_eq!(opts.sync.camera, 300);
        assert_eq!(opts.sync.backup, 3600);
        assert!(opts.enable.relay);
        assert!(!opts.insecure_hub_tls);
    }

    #[test]
    fn intervals_and_flags_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_options(
            &dir,
            r#"
portal_url = "https://portal.example"
auth_code = "ABC123"

[sync]
electricity = 15
backup = 7200

[enable]
backup = false
"#,
        );

        let opts = load_options(&path).unwrap();
        assert_eq!(opts.auth_code.as_deref(), Some("ABC123"));
        assert_eq!(opts.sync.electricity, 15);
        assert_eq!(opts.sync.backup, 7200);
        assert!(!opts.enable.backup);
        assert!(opts.enable.electricity);
    }

    #[test]
    fn relay_endpoint_derived_from_portal_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_options(&dir, "portal_url = \"https://portal.example\"\n");

        let opts = load_options(&path).unwrap();
        assert_eq!(
            opts.relay_endpoint().unwrap().as_str(),
            "wss://portal.example/functions/v1/camera-relay"
        );
    }

    #[test]
    fn relay_endpoint_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_options(
            &dir,
            "portal_url = \"https://portal.example\"\nrelay_endpoint = \"wss://relay.example/v2\"\n",
        );

        let opts = load_options(&path).unwrap();
        assert_eq!(opts.relay_endpoint().unwrap().as_str(), "wss://relay.example/v2");
    }

    #[test]
    fn credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");

        assert!(StoredCredentials::load(&path).unwrap().is_none());

        let creds = StoredCredentials {
            cabin_id: "cabin-42".into(),
            ha_username: "user".into(),
            ha_password: SecretString::from("pass".to_owned()),
            portal_url: "https://portal.example".parse().unwrap(),
            saved_at: Utc::now(),
        };
        creds.save(&path).unwrap();

        let loaded = StoredCredentials::load(&path).unwrap().unwrap();
        assert_eq!(loaded.cabin_id, "cabin-42");
        assert_eq!(loaded.ha_username, "user");
        assert_eq!(loaded.ha_password.expose_secret(), "pass");

        StoredCredentials::delete(&path).unwrap();
        assert!(StoredCredentials::load(&path).unwrap().is_none());
        StoredCredentials::delete(&path).unwrap(); // idempotent
    }

    #[test]
    fn stored_password_redacted_in_debug_but_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        let creds = StoredCredentials {
            cabin_id: "cabin-42".into(),
            ha_username: "user".into(),
            ha_password: SecretString::from("hunter2".to_owned()),
            portal_url: "https://portal.example".parse().unwrap(),
            saved_at: Utc::now(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));

        creds.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("hunter2"));
    }
}
