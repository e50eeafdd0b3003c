//! # LinkSupervisor: per-device connection state machine.
//!
//! One supervisor owns one device's link exclusively and drives it through
//! its lifecycle:
//!
//! ```text
//! Idle ──► Connecting ──► AwaitingPairing ──► Open
//!              │                │              │
//!              │ (creds exist)  │              ├─ Closed(transient) ──► Reconnecting ─┐
//!              └────────────────┴──► Open      ├─ Closed(logged_out) ─► LoggedOut     │
//!                                              └─ Closed(other) ──────► Failed        │
//!                                                                                     │
//!         ┌───────────────────────── fresh Connecting attempt ◄── sleep(5s) ──────────┘
//! ```
//!
//! Each dial attempt yields a [`NextAction`] consumed by the driving loop in
//! [`LinkSupervisor::run`]; reconnects never recurse, they loop.
//!
//! ## Rules
//! - Transitions for one device are strictly sequential: the driving loop
//!   starts a new attempt only after the previous one resolved.
//! - A pairing code is requested **exactly once** per attempt, after a short
//!   delay, and only when no credential blob exists yet.
//! - The credential blob and the registry entry are torn down **together**
//!   on a permanent (`logged_out`) close.
//! - A stuck attempt is force-failed after the connect timeout, closing the
//!   link so no timers or streams leak.
//! - Transient closes retry without bound; everything else is final.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind, SessionStatus};
use crate::store::{ActiveTable, CredentialStore, SessionStore};
use crate::transport::{CloseCode, Link, LinkEvent, LinkHandle, Transport};

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No attempt in progress.
    Idle,
    /// Dialing the remote network.
    Connecting,
    /// Waiting for the human to enter the pairing code.
    AwaitingPairing,
    /// Established and authenticated.
    Open,
    /// Transient close observed; a fresh attempt is scheduled.
    Reconnecting,
    /// Permanently logged out; credentials were torn down. Final.
    LoggedOut,
    /// Failed without a retry path. Final unless an external caller retries.
    Failed,
}

/// What the driving loop does after one dial attempt resolves.
enum NextAction {
    /// Start a fresh attempt after `delay`.
    Retry { delay: Duration },
    /// Stop with the given final state.
    Stop(LinkState),
}

/// Shared dependencies handed to every supervisor.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub cfg: Config,
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<SessionStore>,
    pub creds: Arc<CredentialStore>,
    pub active: Arc<ActiveTable>,
    pub bus: EventBus,
}

/// Drives one device's link through its lifecycle.
pub(crate) struct LinkSupervisor {
    tenant: String,
    device: String,
    ctx: LinkContext,
}

impl LinkSupervisor {
    pub(crate) fn new(ctx: LinkContext, tenant: String, device: String) -> Self {
        Self {
            tenant,
            device,
            ctx,
        }
    }

    /// Runs dial attempts until a final state or cancellation.
    ///
    /// Transient closes loop back here with a fixed delay; each iteration is
    /// logically a fresh supervisor for the same device, so at most one is
    /// ever active per device.
    pub(crate) async fn run(self, token: CancellationToken) -> LinkState {
        loop {
            if token.is_cancelled() {
                return LinkState::Idle;
            }
            match self.attempt(&token).await {
                NextAction::Retry { delay } => {
                    debug!(device = %self.device, ?delay, "reconnect scheduled");
                    let sleep = time::sleep(delay);
                    tokio::pin!(sleep);
                    tokio::select! {
                        _ = &mut sleep => {}
                        _ = token.cancelled() => return LinkState::Idle,
                    }
                }
                NextAction::Stop(state) => return state,
            }
        }
    }

    /// One dial attempt: connect, then consume lifecycle events until the
    /// link resolves.
    async fn attempt(&self, token: &CancellationToken) -> NextAction {
        info!(tenant = %self.tenant, device = %self.device, "starting connection attempt");
        self.publish(
            Event::new(EventKind::Status)
                .with_status(SessionStatus::Connecting)
                .with_message("starting connection"),
        )
        .await;

        let cred_dir = self.ctx.creds.dir_for(&self.tenant, &self.device);
        let connect = self
            .ctx
            .transport
            .connect(&self.tenant, &self.device, &cred_dir);
        let link = match time::timeout(self.ctx.cfg.connect_timeout, connect).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                warn!(device = %self.device, %err, "transport failed to dial");
                self.publish(
                    Event::new(EventKind::Error)
                        .with_status(SessionStatus::Failed)
                        .with_message(format!("connection failed: {err}")),
                )
                .await;
                return NextAction::Stop(LinkState::Failed);
            }
            Err(_elapsed) => {
                return self.fail_timeout().await;
            }
        };

        self.drive(link, token).await
    }

    /// Consumes the link's event stream and maps each lifecycle event onto
    /// a state transition with its side effects.
    async fn drive(&self, link: Link, token: &CancellationToken) -> NextAction {
        let Link { handle, mut events } = link;
        let mut open = false;
        let mut pairing_requested = false;

        let connect_deadline = time::sleep(self.ctx.cfg.connect_timeout);
        tokio::pin!(connect_deadline);
        // Armed on the first `Connecting` signal for an unpaired device.
        let pairing_timer = time::sleep(Duration::ZERO);
        tokio::pin!(pairing_timer);
        let mut pairing_armed = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    handle.close().await;
                    if open {
                        self.ctx.active.remove(&self.device).await;
                    }
                    return NextAction::Stop(LinkState::Idle);
                }
                _ = &mut connect_deadline, if !open => {
                    handle.close().await;
                    return self.fail_timeout().await;
                }
                _ = &mut pairing_timer, if pairing_armed => {
                    pairing_armed = false;
                    self.request_pairing(handle.as_ref()).await;
                }
                ev = events.recv() => match ev {
                    Some(LinkEvent::Connecting) => {
                        debug!(device = %self.device, "link connecting");
                        self.publish(
                            Event::new(EventKind::Status)
                                .with_status(SessionStatus::Connecting)
                                .with_message("connecting to network"),
                        )
                        .await;
                        if !pairing_requested && !self.ctx.creds.is_paired(&self.tenant, &self.device) {
                            pairing_requested = true;
                            pairing_timer
                                .as_mut()
                                .reset(time::Instant::now() + self.ctx.cfg.pairing_delay);
                            pairing_armed = true;
                        }
                    }
                    Some(LinkEvent::Qr(qr)) => {
                        self.publish(
                            Event::new(EventKind::Qr)
                                .with_status(SessionStatus::WaitingPairing)
                                .with_qr(qr)
                                .with_message("scan the QR code"),
                        )
                        .await;
                    }
                    Some(LinkEvent::Credentials(blob)) => {
                        if let Err(err) = self.ctx.creds.persist(&self.tenant, &self.device, &blob) {
                            error!(device = %self.device, %err, "failed to persist credentials");
                            self.publish(
                                Event::new(EventKind::Error)
                                    .with_status(SessionStatus::Error)
                                    .with_message(format!("credential write failed: {err}")),
                            )
                            .await;
                        }
                    }
                    Some(LinkEvent::Open) => {
                        open = true;
                        info!(tenant = %self.tenant, device = %self.device, "connected");
                        self.ctx.active.insert(&self.device, Arc::clone(&handle)).await;
                        if let Err(err) = self.ctx.sessions.add_device(&self.tenant, &self.device).await {
                            error!(device = %self.device, %err, "failed to register session");
                        }
                        self.publish(
                            Event::new(EventKind::Success)
                                .with_status(SessionStatus::Connected)
                                .with_message("connected successfully"),
                        )
                        .await;
                    }
                    Some(LinkEvent::Closed(code)) => {
                        return self.on_closed(code, open).await;
                    }
                    // Stream dropped without a close status: abnormal close.
                    None => {
                        warn!(device = %self.device, "event stream ended without close status");
                        if open {
                            self.ctx.active.remove(&self.device).await;
                        } else {
                            self.publish(
                                Event::new(EventKind::Error)
                                    .with_status(SessionStatus::Failed)
                                    .with_message("connection dropped unexpectedly"),
                            )
                            .await;
                        }
                        return NextAction::Stop(LinkState::Failed);
                    }
                }
            }
        }
    }

    /// Classifies a close status and performs the transition's side effects.
    async fn on_closed(&self, code: CloseCode, open: bool) -> NextAction {
        warn!(device = %self.device, %code, "link closed");
        if open {
            self.ctx.active.remove(&self.device).await;
        }

        if code.is_permanent() {
            // Blob and registry entry go away together; a half-removed
            // session would resurrect a dead device at the next reload.
            if let Err(err) = self.ctx.creds.purge(&self.tenant, &self.device) {
                error!(device = %self.device, %err, "failed to purge credentials");
            }
            if let Err(err) = self
                .ctx
                .sessions
                .remove_device(&self.tenant, &self.device)
                .await
            {
                error!(device = %self.device, %err, "failed to deregister session");
            }
            self.publish(
                Event::new(EventKind::Error)
                    .with_status(SessionStatus::LoggedOut)
                    .with_message("device logged out, pair again"),
            )
            .await;
            return NextAction::Stop(LinkState::LoggedOut);
        }

        if code.is_transient() {
            self.publish(
                Event::new(EventKind::Status)
                    .with_status(SessionStatus::Reconnecting)
                    .with_message("reconnecting"),
            )
            .await;
            return NextAction::Retry {
                delay: self.ctx.cfg.reconnect_delay,
            };
        }

        if !open {
            self.publish(
                Event::new(EventKind::Error)
                    .with_status(SessionStatus::Failed)
                    .with_message(format!("connection failed with status: {code}")),
            )
            .await;
        }
        NextAction::Stop(LinkState::Failed)
    }

    /// Publishes the timeout failure and stops the attempt.
    async fn fail_timeout(&self) -> NextAction {
        let timeout = self.ctx.cfg.connect_timeout;
        warn!(device = %self.device, ?timeout, "connect timeout, forcing failure");
        self.publish(
            Event::new(EventKind::Error)
                .with_status(SessionStatus::Timeout)
                .with_message(format!("no connection within {}s", timeout.as_secs())),
        )
        .await;
        NextAction::Stop(LinkState::Failed)
    }

    /// Requests a pairing code and publishes it formatted for transcription.
    async fn request_pairing(&self, handle: &dyn LinkHandle) {
        self.publish(
            Event::new(EventKind::Status)
                .with_status(SessionStatus::RequestingCode)
                .with_message("requesting pairing code"),
        )
        .await;

        match handle.request_pairing_code(&self.device).await {
            Ok(code) => {
                let formatted = format_pairing_code(&code);
                info!(device = %self.device, code = %formatted, "pairing code generated");
                self.publish(
                    Event::new(EventKind::PairingCode)
                        .with_status(SessionStatus::WaitingPairing)
                        .with_code(formatted)
                        .with_message("pairing code generated"),
                )
                .await;
            }
            Err(err) => {
                warn!(device = %self.device, %err, "pairing code request failed");
                self.publish(
                    Event::new(EventKind::Error)
                        .with_status(SessionStatus::Error)
                        .with_message(format!("pairing code request failed: {err}")),
                )
                .await;
            }
        }
    }

    async fn publish(&self, event: Event) {
        self.ctx
            .bus
            .publish(&self.tenant, event.with_device(self.device.clone()))
            .await;
    }
}

/// Formats a raw pairing code into 4-character groups for transcription.
///
/// ```
/// assert_eq!(linkvisor::format_pairing_code("ABCDEFGH"), "ABCD-EFGH");
/// ```
pub fn format_pairing_code(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    chars
        .chunks(4)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::error::SessionError;

    struct MockHandle {
        pairing_requests: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LinkHandle for MockHandle {
        async fn request_pairing_code(&self, _device: &str) -> Result<String, SessionError> {
            self.pairing_requests.fetch_add(1, Ordering::SeqCst);
            Ok("ABCDEFGH".to_string())
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Transport that replays one scripted event sequence per dial attempt.
    struct ScriptedTransport {
        scripts: StdMutex<VecDeque<Vec<LinkEvent>>>,
        // Senders kept alive so undrained streams do not end prematurely.
        retained: StdMutex<Vec<mpsc::Sender<LinkEvent>>>,
        connects: AtomicUsize,
        pairing_requests: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Vec<LinkEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                retained: StdMutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                pairing_requests: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn pairing_requests(&self) -> usize {
            self.pairing_requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(
            &self,
            _tenant: &str,
            _device: &str,
            _cred_dir: &Path,
        ) -> Result<Link, SessionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let (tx, rx) = mpsc::channel(32);
            for ev in script {
                tx.try_send(ev).expect("script exceeds channel capacity");
            }
            self.retained.lock().unwrap().push(tx);
            Ok(Link {
                handle: Arc::new(MockHandle {
                    pairing_requests: Arc::clone(&self.pairing_requests),
                    closed: Arc::clone(&self.closed),
                }),
                events: rx,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        ctx: LinkContext,
        transport: Arc<ScriptedTransport>,
    }

    fn fixture(scripts: Vec<Vec<LinkEvent>>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(scripts);
        let ctx = LinkContext {
            cfg: Config {
                sessions_file: dir.path().join("sessions.json"),
                auth_dir: dir.path().join("auth"),
                ..Config::default()
            },
            transport: transport.clone(),
            sessions: Arc::new(SessionStore::open(dir.path().join("sessions.json")).unwrap()),
            creds: Arc::new(CredentialStore::new(dir.path().join("auth"))),
            active: Arc::new(ActiveTable::new()),
            bus: EventBus::new(64, Duration::from_secs(30)),
        };
        Fixture {
            _dir: dir,
            ctx,
            transport,
        }
    }

    fn supervisor(fx: &Fixture) -> LinkSupervisor {
        LinkSupervisor::new(fx.ctx.clone(), "alice".into(), "6281111".into())
    }

    /// Receives events until one matches, or panics after `limit` events.
    async fn wait_for_event<F>(
        rx: &mut mpsc::Receiver<Event>,
        limit: usize,
        mut pred: F,
    ) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        for _ in 0..limit {
            let ev = rx.recv().await.expect("event stream ended");
            if pred(&ev) {
                return ev;
            }
        }
        panic!("expected event not observed within {limit} events");
    }

    #[test]
    fn pairing_code_grouping() {
        assert_eq!(format_pairing_code("ABCDEFGH"), "ABCD-EFGH");
        assert_eq!(format_pairing_code("ABCDEF"), "ABCD-EF");
        assert_eq!(format_pairing_code("ABC"), "ABC");
        assert_eq!(format_pairing_code(""), "");
    }

    #[tokio::test(start_paused = true)]
    async fn unpaired_device_requests_code_once() {
        let fx = fixture(vec![vec![LinkEvent::Connecting]]);
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token.clone()));

        let ev = wait_for_event(&mut rx, 16, |ev| ev.kind == EventKind::PairingCode).await;
        assert_eq!(ev.code.as_deref(), Some("ABCD-EFGH"));
        assert_eq!(ev.status, Some(SessionStatus::WaitingPairing));
        assert_eq!(fx.transport.pairing_requests(), 1);

        token.cancel();
        assert_eq!(task.await.unwrap(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn paired_device_skips_pairing() {
        let fx = fixture(vec![vec![LinkEvent::Connecting, LinkEvent::Open]]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token.clone()));

        wait_for_event(&mut rx, 16, |ev| ev.kind == EventKind::Success).await;
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.transport.pairing_requests(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_inserts_table_and_registry() {
        let fx = fixture(vec![vec![LinkEvent::Connecting, LinkEvent::Open]]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token.clone()));

        let ev = wait_for_event(&mut rx, 16, |ev| ev.kind == EventKind::Success).await;
        assert_eq!(ev.status, Some(SessionStatus::Connected));
        assert!(fx.ctx.active.contains("6281111").await);
        assert!(fx.ctx.sessions.contains("alice", "6281111").await);

        token.cancel();
        assert_eq!(task.await.unwrap(), LinkState::Idle);
        // Shutdown removes the open link from the table.
        assert!(!fx.ctx.active.contains("6281111").await);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_event_persists_blob() {
        let fx = fixture(vec![vec![
            LinkEvent::Connecting,
            LinkEvent::Credentials(b"noise-state".to_vec()),
            LinkEvent::Open,
        ]]);
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token.clone()));

        wait_for_event(&mut rx, 16, |ev| ev.kind == EventKind::Success).await;
        assert!(fx.ctx.creds.is_paired("alice", "6281111"));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_tears_down_session() {
        let fx = fixture(vec![vec![
            LinkEvent::Connecting,
            LinkEvent::Open,
            LinkEvent::Closed(CloseCode::LoggedOut),
        ]]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token));

        let ev = wait_for_event(&mut rx, 16, |ev| {
            ev.status == Some(SessionStatus::LoggedOut)
        })
        .await;
        assert_eq!(ev.kind, EventKind::Error);
        assert_eq!(task.await.unwrap(), LinkState::LoggedOut);

        assert!(!fx.ctx.creds.is_paired("alice", "6281111"));
        assert!(!fx.ctx.sessions.contains("alice", "6281111").await);
        assert!(!fx.ctx.active.contains("6281111").await);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_close_reconnects() {
        let fx = fixture(vec![
            vec![
                LinkEvent::Connecting,
                LinkEvent::Open,
                LinkEvent::Closed(CloseCode::RestartRequired),
            ],
            vec![LinkEvent::Connecting, LinkEvent::Open],
        ]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token.clone()));

        wait_for_event(&mut rx, 16, |ev| {
            ev.status == Some(SessionStatus::Reconnecting)
        })
        .await;
        // The next Success only arrives after the reconnect delay elapsed
        // and a fresh dial attempt opened.
        wait_for_event(&mut rx, 32, |ev| ev.kind == EventKind::Success).await;
        assert_eq!(fx.transport.connects(), 2);
        assert!(fx.ctx.active.contains("6281111").await);

        token.cancel();
        assert_eq!(task.await.unwrap(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_close_before_open_fails() {
        let fx = fixture(vec![vec![
            LinkEvent::Connecting,
            LinkEvent::Closed(CloseCode::Other(500)),
        ]]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token));

        let ev = wait_for_event(&mut rx, 16, |ev| ev.status == Some(SessionStatus::Failed)).await;
        assert!(ev.message.as_deref().unwrap().contains("status_500"));
        assert_eq!(task.await.unwrap(), LinkState::Failed);
        assert_eq!(fx.transport.connects(), 1);
        // No retry for unclassified closes.
        assert!(fx.ctx.creds.is_paired("alice", "6281111"));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connecting_times_out() {
        // Script never reaches Open; the retained sender keeps the stream
        // alive so only the deadline can resolve the attempt.
        let fx = fixture(vec![vec![LinkEvent::Connecting]]);
        fx.ctx.creds.persist("alice", "6281111", b"blob").unwrap();
        let mut rx = fx.ctx.bus.subscribe("alice").await;
        let token = CancellationToken::new();
        let task = tokio::spawn(supervisor(&fx).run(token));

        let ev = wait_for_event(&mut rx, 16, |ev| {
            ev.status == Some(SessionStatus::Timeout)
        })
        .await;
        assert_eq!(ev.kind, EventKind::Error);
        assert_eq!(task.await.unwrap(), LinkState::Failed);
        assert_eq!(fx.transport.closed.load(Ordering::SeqCst), 1);
    }
}
