//! # SessionManager: the surrounding application's entry point.
//!
//! Owns the shared registries (durable session store, credential store,
//! active table, event bus) and the per-device single-supervisor guard, and
//! exposes the operations the application consumes:
//!
//! - [`SessionManager::request_connect`] — validate, then spawn a supervisor
//!   for (tenant, device);
//! - [`SessionManager::request_disconnect`] — explicit deletion: stop the
//!   supervisor, close the link, purge credentials and the registry entry;
//! - [`SessionManager::list_sessions`] — registered devices with their
//!   connected flag;
//! - [`SessionManager::subscribe_events`] — the tenant's live status channel;
//! - [`SessionManager::active_count`] — number of open links.
//!
//! ## Rules
//! - At most one supervisor per device, enforced by the `running` guard;
//!   the slot is freed only when its task exits.
//! - Supervisor tasks are panic-isolated: a fault in one device's handling
//!   is reported as an error event and never affects other devices.
//! - Malformed ids are rejected synchronously; no state is created.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::core::supervisor::{LinkContext, LinkSupervisor};
use crate::error::SessionError;
use crate::events::{Event, EventBus, EventKind, SessionStatus};
use crate::store::{ActiveTable, CredentialStore, SessionStore};
use crate::transport::Transport;

/// One registered device and whether its link is currently open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Device id.
    pub device: String,
    /// True while the device's connection state is `Open`.
    pub connected: bool,
}

struct SupervisorSlot {
    token: CancellationToken,
    /// Generation tag so a slow-exiting task never frees a successor's slot.
    gen: u64,
}

/// Multi-tenant session runtime: registries, supervisors, and the
/// application-facing operations.
pub struct SessionManager {
    ctx: LinkContext,
    running: Arc<Mutex<HashMap<String, SupervisorSlot>>>,
    next_gen: AtomicU64,
    token: CancellationToken,
}

impl SessionManager {
    /// Opens the durable stores from `cfg` and builds the runtime.
    pub fn new(cfg: Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>, SessionError> {
        let sessions = Arc::new(SessionStore::open(&cfg.sessions_file)?);
        let creds = Arc::new(CredentialStore::new(&cfg.auth_dir));
        let active = Arc::new(ActiveTable::new());
        let bus = EventBus::new(cfg.event_capacity, cfg.keepalive_interval);
        Ok(Arc::new(Self {
            ctx: LinkContext {
                cfg,
                transport,
                sessions,
                creds,
                active,
                bus,
            },
            running: Arc::new(Mutex::new(HashMap::new())),
            next_gen: AtomicU64::new(0),
            token: CancellationToken::new(),
        }))
    }

    /// Starts a connection for `(tenant, device)`.
    ///
    /// Rejects malformed ids synchronously. A connect request for a device
    /// whose supervisor is already running is a no-op.
    pub async fn request_connect(&self, tenant: &str, device: &str) -> Result<(), SessionError> {
        validate_tenant(tenant)?;
        validate_device_id(device)?;
        if !self.spawn_supervisor(tenant, device).await {
            debug!(device, "supervisor already running, connect request ignored");
        }
        Ok(())
    }

    /// Explicitly deletes a session: stops the supervisor, closes the link,
    /// and removes the credential blob together with the registry entry.
    pub async fn request_disconnect(&self, tenant: &str, device: &str) -> Result<(), SessionError> {
        validate_tenant(tenant)?;
        validate_device_id(device)?;

        // Stop the supervisor first so teardown is not observed as a failure.
        if let Some(slot) = self.running.lock().await.remove(device) {
            slot.token.cancel();
        }
        if let Some(handle) = self.ctx.active.remove(device).await {
            handle.close().await;
        }
        self.ctx.creds.purge(tenant, device)?;
        self.ctx.sessions.remove_device(tenant, device).await?;

        self.ctx
            .bus
            .publish(
                tenant,
                Event::new(EventKind::Status)
                    .with_device(device)
                    .with_status(SessionStatus::LoggedOut)
                    .with_message("session removed"),
            )
            .await;
        Ok(())
    }

    /// Registered devices for `tenant` with their connected flag.
    pub async fn list_sessions(&self, tenant: &str) -> Vec<SessionInfo> {
        let devices = self.ctx.sessions.devices_for(tenant).await;
        let mut out = Vec::with_capacity(devices.len());
        for device in devices {
            let connected = self.ctx.active.contains(&device).await;
            out.push(SessionInfo { device, connected });
        }
        out
    }

    /// The tenant's live status channel (replaces any prior subscriber).
    pub async fn subscribe_events(&self, tenant: &str) -> mpsc::Receiver<Event> {
        self.ctx.bus.subscribe(tenant).await
    }

    /// Number of currently open links across all tenants.
    pub async fn active_count(&self) -> usize {
        self.ctx.active.count().await
    }

    /// Stops all supervisors. In-flight persistence may not complete; the
    /// durable registry stays consistent thanks to atomic whole-file writes.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Spawns a supervisor for the device unless one is already running.
    ///
    /// Returns false if the device's slot was occupied. The spawned task is
    /// panic-isolated and frees its slot on exit.
    pub(crate) async fn spawn_supervisor(&self, tenant: &str, device: &str) -> bool {
        let gen = self.next_gen.fetch_add(1, AtomicOrdering::Relaxed);
        let child = self.token.child_token();
        {
            let mut running = self.running.lock().await;
            if running.contains_key(device) {
                return false;
            }
            running.insert(
                device.to_string(),
                SupervisorSlot {
                    token: child.clone(),
                    gen,
                },
            );
        }

        let ctx = self.ctx.clone();
        let running = Arc::clone(&self.running);
        let tenant = tenant.to_string();
        let device = device.to_string();
        tokio::spawn(async move {
            let supervisor = LinkSupervisor::new(ctx.clone(), tenant.clone(), device.clone());
            let outcome = std::panic::AssertUnwindSafe(supervisor.run(child))
                .catch_unwind()
                .await;
            match outcome {
                Ok(final_state) => {
                    debug!(%device, ?final_state, "supervisor finished");
                }
                Err(panic) => {
                    error!(%device, ?panic, "supervisor panicked");
                    ctx.active.remove(&device).await;
                    ctx.bus
                        .publish(
                            &tenant,
                            Event::new(EventKind::Error)
                                .with_device(device.clone())
                                .with_status(SessionStatus::Error)
                                .with_message("internal fault while handling connection"),
                        )
                        .await;
                }
            }

            let mut running = running.lock().await;
            if running.get(&device).is_some_and(|slot| slot.gen == gen) {
                running.remove(&device);
            }
        });
        true
    }

    pub(crate) fn ctx(&self) -> &LinkContext {
        &self.ctx
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Device ids are phone-number-like: digits only, 6 to 15 characters.
fn validate_device_id(device: &str) -> Result<(), SessionError> {
    if device.is_empty() {
        return Err(SessionError::Validation {
            reason: "device id is empty".into(),
        });
    }
    if !device.chars().all(|c| c.is_ascii_digit()) {
        return Err(SessionError::Validation {
            reason: format!("device id '{device}' must contain digits only"),
        });
    }
    if device.len() < 6 || device.len() > 15 {
        return Err(SessionError::Validation {
            reason: format!("device id '{device}' length out of range (6..=15)"),
        });
    }
    Ok(())
}

/// Tenant ids become path components of the credential store, so only a
/// conservative character set is accepted.
fn validate_tenant(tenant: &str) -> Result<(), SessionError> {
    if tenant.is_empty() {
        return Err(SessionError::Validation {
            reason: "tenant id is empty".into(),
        });
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SessionError::Validation {
            reason: format!("tenant id '{tenant}' contains unsupported characters"),
        });
    }
    Ok(())
}
