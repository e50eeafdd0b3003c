//! # ReconnectOrchestrator: startup bulk reconnect and self-healing.
//!
//! At startup the orchestrator reads the durable session registry and, for
//! every device that paired before (credential blob on disk), spawns an
//! independent supervisor. After an observation window it counts open
//! devices; as long as none opened and the attempt budget is left, it
//! repeats the whole pass.
//!
//! ```text
//! startup ──► sleep(startup_delay) ──► pass #1 ──► observe 30s ──► any open? ── yes ──► done
//!                                        ▲                            │ no
//!                                        └── attempt < 3 ─────────────┘
//!
//! every 10min: registered > 0 && open == 0 ? ──► reset budget, re-run passes
//! ```
//!
//! ## Rules
//! - Devices without a credential blob are skipped (pairing cannot be
//!   replayed unattended).
//! - Supervisors are spawned independently; one device's failure never
//!   blocks another's attempt.
//! - An empty registry means nothing to do: the orchestrator stays idle,
//!   with the health check still armed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::manager::SessionManager;

/// Bulk-reconnect and health-check loop over all registered sessions.
pub struct ReconnectOrchestrator {
    manager: Arc<SessionManager>,
}

impl ReconnectOrchestrator {
    /// Creates an orchestrator over the manager's registries.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Spawns the orchestrator loop; it runs until the manager shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        let token = self.manager.shutdown_token();
        tokio::spawn(async move { self.run(token).await })
    }

    async fn run(self, token: CancellationToken) {
        let cfg = self.manager.ctx().cfg.clone();

        let startup = time::sleep(cfg.startup_delay);
        tokio::pin!(startup);
        tokio::select! {
            _ = &mut startup => {}
            _ = token.cancelled() => return,
        }
        info!("startup session reload beginning");
        self.reload_with_retry(&token).await;

        let mut ticker = time::interval(cfg.health_interval);
        ticker.tick().await; // first tick resolves immediately
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let registered = self.manager.ctx().sessions.registered_count().await;
                    let open = self.manager.active_count().await;
                    info!(open, registered, "health check");
                    if registered > 0 && open == 0 {
                        warn!("registered sessions but none active, reloading");
                        self.reload_with_retry(&token).await;
                    }
                }
            }
        }
    }

    /// Runs bulk passes until one produces an open device or the budget is
    /// spent.
    async fn reload_with_retry(&self, token: &CancellationToken) {
        let cfg = self.manager.ctx().cfg.clone();

        for attempt in 1..=cfg.max_reload_attempts {
            let registered = self.manager.ctx().sessions.registered_count().await;
            if registered == 0 {
                debug!("no sessions to reload, awaiting user-initiated connects");
                return;
            }

            let attempted = self.reload_pass(attempt).await;
            info!(
                attempt,
                max = cfg.max_reload_attempts,
                registered,
                attempted,
                "reload pass dispatched"
            );

            let observe = time::sleep(cfg.observe_window);
            tokio::pin!(observe);
            tokio::select! {
                _ = &mut observe => {}
                _ = token.cancelled() => return,
            }

            let open = self.manager.active_count().await;
            info!(attempt, open, attempted, "reload pass observed");
            if open > 0 {
                info!(open, "reload succeeded");
                return;
            }
        }
        warn!("all reload attempts failed, manual reconnection required");
    }

    /// One pass: spawn a supervisor for every previously paired device.
    /// Returns the number of devices attempted.
    async fn reload_pass(&self, attempt: u32) -> usize {
        let ctx = self.manager.ctx();
        let snapshot = ctx.sessions.snapshot().await;

        let mut attempted = 0;
        for (tenant, devices) in snapshot {
            for device in devices {
                if !ctx.creds.is_paired(&tenant, &device) {
                    debug!(%tenant, %device, "no credential blob, skipping");
                    continue;
                }
                attempted += 1;
                if !self.manager.spawn_supervisor(&tenant, &device).await {
                    debug!(%tenant, %device, attempt, "supervisor already running");
                }
            }
        }
        attempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::config::Config;
    use crate::error::SessionError;
    use crate::transport::{Link, LinkEvent, LinkHandle, Transport};

    struct IdleHandle;

    #[async_trait]
    impl LinkHandle for IdleHandle {
        async fn request_pairing_code(&self, _device: &str) -> Result<String, SessionError> {
            Ok("AAAABBBB".into())
        }
        async fn close(&self) {}
    }

    enum Behavior {
        /// Every dial fails outright.
        Refuse,
        /// Every dial reaches Open immediately.
        OpenImmediately,
    }

    struct FlakyTransport {
        behavior: Behavior,
        connects: AtomicUsize,
        retained: std::sync::Mutex<Vec<mpsc::Sender<LinkEvent>>>,
    }

    impl FlakyTransport {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                connects: AtomicUsize::new(0),
                retained: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(
            &self,
            _tenant: &str,
            _device: &str,
            _cred_dir: &Path,
        ) -> Result<Link, SessionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Refuse => Err(SessionError::Transport("connection refused".into())),
                Behavior::OpenImmediately => {
                    let (tx, rx) = mpsc::channel(8);
                    tx.try_send(LinkEvent::Connecting).unwrap();
                    tx.try_send(LinkEvent::Open).unwrap();
                    self.retained.lock().unwrap().push(tx);
                    Ok(Link {
                        handle: Arc::new(IdleHandle),
                        events: rx,
                    })
                }
            }
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        Config {
            sessions_file: dir.path().join("sessions.json"),
            auth_dir: dir.path().join("auth"),
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_registry_stays_idle() {
        let dir = TempDir::new().unwrap();
        let transport = FlakyTransport::new(Behavior::Refuse);
        let manager = SessionManager::new(test_config(&dir), transport.clone()).unwrap();

        ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
        // Past startup delay and well into where passes would run.
        time::sleep(Duration::from_secs(200)).await;

        assert_eq!(transport.connects(), 0);
        assert_eq!(manager.active_count().await, 0);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn device_without_blob_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = FlakyTransport::new(Behavior::OpenImmediately);
        let manager = SessionManager::new(test_config(&dir), transport.clone()).unwrap();
        // Registered but never paired: no credential blob on disk.
        manager
            .ctx()
            .sessions
            .add_device("alice", "6281111")
            .await
            .unwrap();

        ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
        time::sleep(Duration::from_secs(200)).await;

        assert_eq!(transport.connects(), 0);
        assert_eq!(manager.active_count().await, 0);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_stops_after_three_passes() {
        let dir = TempDir::new().unwrap();
        let transport = FlakyTransport::new(Behavior::Refuse);
        let manager = SessionManager::new(test_config(&dir), transport.clone()).unwrap();
        manager
            .ctx()
            .sessions
            .add_device("alice", "6281111")
            .await
            .unwrap();
        manager.ctx().creds.persist("alice", "6281111", b"blob").unwrap();

        ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
        // Startup delay (15s) + 3 passes × observe window (30s) + slack,
        // still before the first health-check tick at 10min.
        time::sleep(Duration::from_secs(300)).await;

        assert_eq!(transport.connects(), 3);
        assert_eq!(manager.active_count().await, 0);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_pass_stops_retrying() {
        let dir = TempDir::new().unwrap();
        let transport = FlakyTransport::new(Behavior::OpenImmediately);
        let manager = SessionManager::new(test_config(&dir), transport.clone()).unwrap();
        manager
            .ctx()
            .sessions
            .add_device("alice", "6281111")
            .await
            .unwrap();
        manager.ctx().creds.persist("alice", "6281111", b"blob").unwrap();

        ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
        time::sleep(Duration::from_secs(300)).await;

        assert_eq!(transport.connects(), 1);
        assert_eq!(manager.active_count().await, 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reloads_after_silent_disconnection() {
        let dir = TempDir::new().unwrap();
        let transport = FlakyTransport::new(Behavior::Refuse);
        let manager = SessionManager::new(test_config(&dir), transport.clone()).unwrap();

        ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
        // Startup reload sees an empty registry and idles.
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connects(), 0);

        // A session registered later (with a blob) is picked up by the
        // health check, which re-runs the full retry budget.
        manager
            .ctx()
            .sessions
            .add_device("alice", "6281111")
            .await
            .unwrap();
        manager.ctx().creds.persist("alice", "6281111", b"blob").unwrap();

        time::sleep(Duration::from_secs(800)).await;
        assert_eq!(transport.connects(), 3);
        manager.shutdown();
    }
}
