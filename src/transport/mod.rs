//! # Transport abstraction: the opaque messaging network.
//!
//! The runtime never speaks the remote wire protocol itself. A
//! [`Transport`] implementation dials one device and hands back a
//! [`Link`]: a live [`LinkHandle`] plus a push sequence of
//! [`LinkEvent`]s that the supervisor consumes.
//!
//! ```text
//! Transport::connect(tenant, device, cred_dir)
//!         │
//!         ▼
//!       Link { handle, events }
//!                │
//!                ▼  (consumed by LinkSupervisor)
//!   Connecting → [Qr | Credentials]* → Open → ... → Closed(code)
//! ```
//!
//! ## Rules
//! - One `Link` represents **one** dial attempt; reconnects dial again.
//! - Event order for a single link is the order the remote emitted it.
//! - `Closed` is terminal for a link; the receiver yields no events after it.
//! - Dropping the event stream without a `Closed` is treated by the
//!   supervisor as an abnormal close.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Close status reported by the remote network when a link drops.
///
/// Classification drives the supervisor's retry decision:
/// - [`CloseCode::is_transient`] → reconnect after a fixed delay, uncapped;
/// - [`CloseCode::is_permanent`] → tear the session down, never retry;
/// - anything else before `Open` → final `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Device was logged out remotely; credentials are now invalid.
    LoggedOut,
    /// Remote asked for a restart; expected to resolve on redial.
    RestartRequired,
    /// Connection timed out on the remote side; expected to resolve on redial.
    TimedOut,
    /// Any other status code the remote reported.
    Other(u16),
}

impl CloseCode {
    /// True for codes expected to resolve via retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloseCode::RestartRequired | CloseCode::TimedOut)
    }

    /// True for codes that invalidate the credential blob.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CloseCode::LoggedOut)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCode::LoggedOut => write!(f, "logged_out"),
            CloseCode::RestartRequired => write!(f, "restart_required"),
            CloseCode::TimedOut => write!(f, "timed_out"),
            CloseCode::Other(status) => write!(f, "status_{status}"),
        }
    }
}

/// Connection-lifecycle events pushed by the transport for one link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The transport started dialing.
    Connecting,
    /// A QR payload is available as a pairing alternative.
    Qr(String),
    /// Fresh credential material to persist (issued during pairing and
    /// refreshed over a session's lifetime).
    Credentials(Vec<u8>),
    /// The link is established and authenticated.
    Open,
    /// The link dropped with the given status.
    Closed(CloseCode),
}

/// Live handle to a dialed link.
///
/// Stored in the [`ActiveTable`](crate::ActiveTable) once the link reaches
/// `Open`; callers use it to send traffic and to close the connection.
#[async_trait]
pub trait LinkHandle: Send + Sync + 'static {
    /// Requests a short-lived, human-enterable pairing code for `device`.
    ///
    /// The ~30s validity window is enforced by the remote network.
    async fn request_pairing_code(&self, device: &str) -> Result<String, SessionError>;

    /// Closes the link. Idempotent; closing an already-dead link is a no-op.
    async fn close(&self);
}

/// One dial attempt: the live handle plus its lifecycle event stream.
pub struct Link {
    /// Handle for pairing requests and teardown.
    pub handle: Arc<dyn LinkHandle>,
    /// Push sequence of lifecycle events for this attempt.
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Factory for per-device links to the external messaging network.
///
/// Implementations own the wire protocol; the runtime only consumes the
/// lifecycle event stream. `cred_dir` is where the transport reads
/// previously persisted authentication state from.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts one dial attempt for `(tenant, device)`.
    async fn connect(
        &self,
        tenant: &str,
        device: &str,
        cred_dir: &Path,
    ) -> Result<Link, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_classification() {
        assert!(CloseCode::RestartRequired.is_transient());
        assert!(CloseCode::TimedOut.is_transient());
        assert!(!CloseCode::LoggedOut.is_transient());
        assert!(CloseCode::LoggedOut.is_permanent());
        assert!(!CloseCode::Other(500).is_transient());
        assert!(!CloseCode::Other(500).is_permanent());
    }

    #[test]
    fn close_code_labels() {
        assert_eq!(CloseCode::LoggedOut.to_string(), "logged_out");
        assert_eq!(CloseCode::Other(428).to_string(), "status_428");
    }
}
