//! # Status events pushed to tenant subscribers.
//!
//! [`Event`] is the JSON payload a tenant's live channel carries:
//! `{type, message, number, status, ...}` with optional `code` (pairing)
//! and `qr` fields. [`EventKind`] tags the payload; [`SessionStatus`]
//! carries the fine-grained connection status string.
//!
//! Events are ephemeral (never persisted) and ordered per tenant by a
//! monotonic global sequence number.
//!
//! ## Example
//! ```
//! use linkvisor::{Event, EventKind, SessionStatus};
//!
//! let ev = Event::new(EventKind::PairingCode)
//!     .with_device("6281111")
//!     .with_status(SessionStatus::WaitingPairing)
//!     .with_code("ABCD-EFGH")
//!     .with_message("pairing code generated");
//!
//! let json = serde_json::to_value(&ev).unwrap();
//! assert_eq!(json["type"], "pairing_code");
//! assert_eq!(json["status"], "waiting_pairing");
//! assert_eq!(json["code"], "ABCD-EFGH");
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of status events, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Subscription handshake and periodic keep-alive.
    Connected,
    /// Connection-state progress report.
    Status,
    /// QR payload available as a pairing alternative.
    Qr,
    /// Human-enterable pairing code generated.
    PairingCode,
    /// Link established and authenticated.
    Success,
    /// Failure report (transient or terminal; see `status`).
    Error,
}

/// Fine-grained connection status carried in the `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    RequestingCode,
    WaitingPairing,
    Connected,
    Reconnecting,
    LoggedOut,
    Failed,
    Timeout,
    Error,
}

/// One status event for a tenant's live channel.
///
/// Optional fields are omitted from the JSON payload when unset.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Event classification.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Device id the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    /// Fine-grained connection status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    /// Formatted pairing code (4-char groups).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Raw QR payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    /// Wall-clock timestamp, milliseconds since the Unix epoch.
    pub at: u64,
    /// Monotonic global sequence number for ordering.
    pub seq: u64,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
            number: None,
            status: None,
            code: None,
            qr: None,
            at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Attaches a human-readable message.
    #[inline]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches the device id.
    #[inline]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.number = Some(device.into());
        self
    }

    /// Attaches a connection status.
    #[inline]
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches a formatted pairing code.
    #[inline]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches a raw QR payload.
    #[inline]
    pub fn with_qr(mut self, qr: impl Into<String>) -> Self {
        self.qr = Some(qr.into());
        self
    }

    /// Subscription handshake event, delivered immediately on subscribe.
    #[inline]
    pub fn stream_connected() -> Self {
        Event::new(EventKind::Connected).with_message("event stream connected")
    }

    /// Periodic keep-alive event.
    #[inline]
    pub fn keep_alive() -> Self {
        Event::new(EventKind::Connected).with_message("keep-alive")
    }
}
