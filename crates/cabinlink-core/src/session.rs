// ── Portal session context ──
//
// The cabin identity issued by the portal, held behind an ArcSwap so the
// sync tasks read it lock-free while a refresh swaps it atomically. This
// replaces ambient credential globals: every task gets a SessionStore
// and asks it for the current identity.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use secrecy::SecretString;
use tracing::{info, warn};
use url::Url;

use cabinlink_api::{CabinCredentials, PortalClient};
use cabinlink_config::StoredCredentials;

use crate::error::AgentError;

/// One acquired portal identity. Immutable; a refresh produces a new one.
#[derive(Debug, Clone)]
pub struct PortalSession {
    pub cabin_id: String,
    pub hub_username: String,
    pub hub_password: SecretString,
}

impl PortalSession {
    /// The identity fields attached to every portal upload.
    pub fn credentials(&self) -> CabinCredentials {
        CabinCredentials {
            cabin_id: self.cabin_id.clone(),
            hub_username: self.hub_username.clone(),
            hub_password: self.hub_password.clone(),
        }
    }
}

/// Owns the current [`PortalSession`] and knows how to (re)acquire one.
pub struct SessionStore {
    portal: Arc<PortalClient>,
    portal_url: Url,
    auth_code: Option<SecretString>,
    credentials_file: PathBuf,
    current: ArcSwapOption<PortalSession>,
}

impl SessionStore {
    pub fn new(
        portal: Arc<PortalClient>,
        portal_url: Url,
        auth_code: Option<SecretString>,
        credentials_file: PathBuf,
    ) -> Self {
        Self {
            portal,
            portal_url,
            auth_code,
            credentials_file,
            current: ArcSwapOption::empty(),
        }
    }

    /// The current session, if one has been acquired.
    pub fn current(&self) -> Result<Arc<PortalSession>, AgentError> {
        self.current.load_full().ok_or_else(|| AgentError::NoSession {
            reason: "not authenticated with the portal".into(),
        })
    }

    /// Load persisted credentials, falling back to an auth-code exchange.
    pub async fn load_or_acquire(&self) -> Result<Arc<PortalSession>, AgentError> {
        match StoredCredentials::load(&self.credentials_file) {
            Ok(Some(stored)) => {
                info!(cabin_id = %stored.cabin_id, "loaded persisted portal credentials");
                let session = Arc::new(PortalSession {
                    cabin_id: stored.cabin_id,
                    hub_username: stored.ha_username,
                    hub_password: stored.ha_password,
                });
                self.current.store(Some(Arc::clone(&session)));
                return Ok(session);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "ignoring unreadable credential file");
            }
        }

        self.refresh().await
    }

    /// Exchange the configured auth code for a fresh session and persist it.
    pub async fn refresh(&self) -> Result<Arc<PortalSession>, AgentError> {
        let auth_code = self.auth_code.as_ref().ok_or_else(|| AgentError::NoSession {
            reason: "no auth code configured and no persisted credentials".into(),
        })?;

        let grant = self.portal.authenticate(auth_code).await?;
        info!(cabin_id = %grant.cabin_id, "portal authentication successful");

        let stored = StoredCredentials {
            cabin_id: grant.cabin_id.clone(),
            ha_username: grant.ha_username.clone(),
            ha_password: SecretString::from(grant.ha_password.clone()),
            portal_url: self.portal_url.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = stored.save(&self.credentials_file) {
            // A failed write is not fatal: the session works for this run.
            warn!(error = %e, "could not persist portal credentials");
        }

        let session = Arc::new(PortalSession {
            cabin_id: grant.cabin_id,
            hub_username: grant.ha_username,
            hub_password: SecretString::from(grant.ha_password),
        });
        self.current.store(Some(Arc::clone(&session)));
        Ok(session)
    }

    /// Drop the in-memory session and the persisted file.
    ///
    /// The next [`load_or_acquire`](Self::load_or_acquire) or
    /// [`refresh`](Self::refresh) starts from the auth code again.
    pub fn invalidate(&self) {
        self.current.store(None);
        if let Err(e) = StoredCredentials::delete(&self.credentials_file) {
            warn!(error = %e, "could not delete persisted credentials");
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("portal_url", &self.portal_url.as_str())
            .field("has_auth_code", &self.auth_code.is_some())
            .field("credentials_file", &self.credentials_file)
            .field("has_session", &self.current.load().is_some())
            .finish()
    }
}
