//! Error types used by the linkvisor runtime.
//!
//! [`SessionError`] classifies every failure the runtime can report:
//!
//! - **Transient** — the remote side closed with a restart/timeout code;
//!   the supervisor schedules a reconnect.
//! - **LoggedOut** — permanent auth failure; the session is torn down and
//!   never retried (re-pairing required).
//! - **Timeout** — no lifecycle transition within the connect window.
//! - **Validation** — malformed input rejected synchronously, no state created.
//! - **Storage** — filesystem failure; the durable registry is never left
//!   half-written (it is overwritten only after successful serialization).
//! - **Transport** — the opaque transport failed to even start an attempt.
//!
//! The helper methods (`as_label`, `is_transient`) follow the same
//! logging/metrics conventions as the rest of the runtime.

use std::time::Duration;

use thiserror::Error;

use crate::transport::CloseCode;

/// # Errors produced by the session runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SessionError {
    /// Link closed with a transient code; a reconnect is scheduled.
    #[error("transient disconnect ({code}); reconnect scheduled")]
    Transient {
        /// Close code reported by the transport.
        code: CloseCode,
    },

    /// Device was logged out remotely; credentials are invalid and the
    /// session must be paired again.
    #[error("device logged out; pairing required")]
    LoggedOut,

    /// The connection did not reach `Open` within the configured window.
    #[error("connection timed out after {timeout:?}")]
    Timeout {
        /// The timeout window that elapsed.
        timeout: Duration,
    },

    /// Malformed tenant or device id; rejected before any state is created.
    #[error("validation failed: {reason}")]
    Validation {
        /// Why the input was rejected.
        reason: String,
    },

    /// Filesystem failure while reading or writing durable state.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// The transport could not start or service a connection attempt.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SessionError {
    /// Returns a short stable label (snake_case) for use in logs and events.
    ///
    /// # Example
    /// ```
    /// use linkvisor::SessionError;
    ///
    /// let err = SessionError::LoggedOut;
    /// assert_eq!(err.as_label(), "logged_out");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::Transient { .. } => "transient_disconnect",
            SessionError::LoggedOut => "logged_out",
            SessionError::Timeout { .. } => "timeout",
            SessionError::Validation { .. } => "validation",
            SessionError::Storage(_) => "storage",
            SessionError::Transport(_) => "transport",
        }
    }

    /// Indicates whether the failure is expected to resolve via retry.
    ///
    /// Only [`SessionError::Transient`] qualifies; everything else either
    /// requires operator action (`LoggedOut`, `Validation`) or is surfaced
    /// as a final failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Transient { .. })
    }
}
