// ── Agent lifecycle ──
//
// Full lifecycle management for the edge agent. Acquires a portal
// session, then runs the sync passes (electricity, cameras, backup),
// the tunnel dispatcher, and the relay sessions as independent
// background tasks until shutdown.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cabinlink_api::{HubClient, PortalClient, TlsMode, TransportConfig};
use cabinlink_config::{ConfigError, Options};

use crate::backup::BackupCollector;
use crate::cameras;
use crate::classify;
use crate::error::AgentError;
use crate::relay::RelayManager;
use crate::session::SessionStore;
use crate::tunnel::TunnelDispatcher;

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<AgentInner>`. Created from [`Options`],
/// started with [`start()`](Self::start), stopped with
/// [`shutdown()`](Self::shutdown).
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    options: Options,
    portal: Arc<PortalClient>,
    hub: Arc<HubClient>,
    session: Arc<SessionStore>,
    relay: Option<Arc<RelayManager>>,
    backup: BackupCollector,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Build the agent's clients from options. Does NOT touch the
    /// network -- call [`start()`](Self::start) to authenticate and
    /// spawn background tasks.
    pub fn new(options: Options) -> Result<Self, AgentError> {
        let hub_token = std::env::var(&options.hub_token_env)
            .map(SecretString::from)
            .map_err(|_| ConfigError::Validation {
                field: options.hub_token_env.clone(),
                reason: "hub token environment variable is not set".into(),
            })?;

        let hub_transport = TransportConfig {
            tls: if options.insecure_hub_tls {
                TlsMode::DangerAcceptInvalid
            } else {
                TlsMode::System
            },
            timeout: Duration::from_secs(options.timeout),
        };
        // The portal always gets full TLS verification.
        let portal_transport = TransportConfig {
            tls: TlsMode::System,
            timeout: Duration::from_secs(options.timeout),
        };

        let hub = Arc::new(HubClient::new(
            options.hub_url.clone(),
            &hub_token,
            &hub_transport,
        )?);
        let portal = Arc::new(PortalClient::new(options.portal_url.clone(), &portal_transport)?);
        let session = Arc::new(SessionStore::new(
            Arc::clone(&portal),
            options.portal_url.clone(),
            options.auth_code.clone().map(SecretString::from),
            options.credentials_file.clone(),
        ));

        let cancel = CancellationToken::new();
        let relay = if options.enable.relay {
            let endpoint = options.relay_endpoint()?;
            Some(Arc::new(RelayManager::new(
                endpoint,
                Arc::clone(&hub),
                Arc::clone(&session),
                cancel.child_token(),
            )))
        } else {
            None
        };

        let backup = BackupCollector::new(options.hub_config_dir.clone());

        Ok(Self {
            inner: Arc::new(AgentInner {
                options,
                portal,
                hub,
                session,
                relay,
                backup,
                cancel,
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Acquire a portal session and spawn the enabled background tasks.
    pub async fn start(&self) -> Result<(), AgentError> {
        let session = self.inner.session.load_or_acquire().await?;
        info!(cabin = %session.cabin_id, "portal session ready");

        let sync = &self.inner.options.sync;
        let enable = &self.inner.options.enable;
        let mut handles = self.inner.task_handles.lock().await;

        if enable.electricity {
            handles.push(tokio::spawn(electricity_task(
                self.clone(),
                Duration::from_secs(sync.electricity),
                self.inner.cancel.child_token(),
            )));
        }
        if enable.cameras {
            handles.push(tokio::spawn(camera_task(
                self.clone(),
                Duration::from_secs(sync.camera),
                self.inner.cancel.child_token(),
            )));
        }
        if enable.backup {
            handles.push(tokio::spawn(backup_task(
                self.clone(),
                Duration::from_secs(sync.backup),
                self.inner.cancel.child_token(),
            )));
        }
        if enable.tunnel {
            let dispatcher = TunnelDispatcher::new(
                Arc::clone(&self.inner.portal),
                Arc::clone(&self.inner.hub),
                Arc::clone(&self.inner.session),
                Duration::from_secs(sync.tunnel_poll),
            );
            let cancel = self.inner.cancel.child_token();
            handles.push(tokio::spawn(async move {
                dispatcher.run(cancel).await;
            }));
        }

        info!(tasks = handles.len(), "agent started");
        Ok(())
    }

    /// Signal every background task to exit, wait for them, and release
    /// any open relay connections.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        if let Some(relay) = &self.inner.relay {
            relay.stop_all().await;
        }

        info!("agent stopped");
    }

    // ── Sync passes ──────────────────────────────────────────────

    /// One electricity pass: snapshot states, classify, upload. Returns
    /// `false` when no reading qualified and nothing was sent.
    pub async fn sync_electricity(&self) -> Result<bool, AgentError> {
        let states = self.inner.hub.states().await?;
        let metrics = classify::classify(&states);
        if metrics.is_empty() {
            debug!("no electrical readings qualified, skipping sync");
            return Ok(false);
        }

        let session = self.inner.session.current()?;
        let payload = serde_json::to_value(&metrics)
            .map_err(|e| AgentError::Api { message: e.to_string() })?;
        self.inner
            .portal
            .sync_electricity(&session.credentials(), &payload)
            .await?;
        debug!("electricity metrics synced");
        Ok(true)
    }

    /// One camera pass: discover cameras, upload the roster, and align
    /// relay sessions with it. Returns the number of cameras found.
    pub async fn sync_cameras(&self) -> Result<usize, AgentError> {
        let states = self.inner.hub.states().await?;
        let discovered = cameras::discover(&states);
        let session = self.inner.session.current()?;

        if discovered.is_empty() {
            debug!("no cameras found to sync");
        } else {
            self.inner
                .portal
                .sync_cameras(&session.credentials(), &discovered)
                .await?;
            info!(count = discovered.len(), "cameras synced");
        }

        if let Some(relay) = &self.inner.relay {
            relay.reconcile(&discovered).await?;
        }
        Ok(discovered.len())
    }

    /// One backup pass: snapshot the hub config files and upload them.
    pub async fn sync_backup(&self) -> Result<(), AgentError> {
        let snapshot = self.inner.backup.snapshot();
        let session = self.inner.session.current()?;
        self.inner
            .portal
            .sync_backup(&session.credentials(), &snapshot)
            .await?;
        info!("configuration backup synced");
        Ok(())
    }

    /// Per-cycle error handling shared by the sync tasks. Transient
    /// failures just wait for the next tick; an expired session is
    /// invalidated and re-acquired so the next cycle can succeed.
    async fn recover(&self, task: &str, err: &AgentError) {
        if err.is_auth_expired() {
            warn!(task, error = %err, "portal session rejected, refreshing");
            self.inner.session.invalidate();
            if let Err(refresh_err) = self.inner.session.refresh().await {
                warn!(task, error = %refresh_err, "session refresh failed");
            }
        } else if err.is_transient() {
            debug!(task, error = %err, "transient failure, retrying next cycle");
        } else {
            warn!(task, error = %err, "sync failed");
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────
//
// One task per sync concern. The first tick fires immediately, so each
// concern syncs once right after start and then settles into its
// interval. A failed cycle never kills the task.

async fn electricity_task(agent: Agent, period: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if let Err(err) = agent.sync_electricity().await {
            agent.recover("electricity", &err).await;
        }
    }
    debug!("electricity task exiting");
}

async fn camera_task(agent: Agent, period: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if let Err(err) = agent.sync_cameras().await {
            agent.recover("cameras", &err).await;
        }
    }
    debug!("camera task exiting");
}

async fn backup_task(agent: Agent, period: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if let Err(err) = agent.sync_backup().await {
            agent.recover("backup", &err).await;
        }
    }
    debug!("backup task exiting");
}
