//! # linkvisor
//!
//! **Linkvisor** is a multi-tenant connection-session manager for Rust.
//!
//! It establishes, authenticates, persists, and automatically recovers many
//! concurrent long-lived connections to an external real-time messaging
//! network, one connection per (tenant, device) pair. The wire protocol is
//! out of scope: the network is an opaque [`Transport`] supplying dial,
//! pairing, and a push sequence of connection-lifecycle events.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────────────────────────────────────────────────────────┐
//!     │  SessionManager (application-facing operations)                  │
//!     │  - SessionStore (durable tenant → devices registry, JSON)        │
//!     │  - CredentialStore (per-device credential blobs on disk)         │
//!     │  - ActiveTable (device → live link handle, in-memory)            │
//!     │  - EventBus (per-tenant status channels, keep-alive)             │
//!     └──────┬──────────────────┬──────────────────┬─────────────────────┘
//!            ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │LinkSupervisor│   │LinkSupervisor│   │LinkSupervisor│  (one per device)
//!     │(state machine│   │  Connecting→ │   │  Open→Closed │
//!     │ + retry loop)│   │AwaitingPair. │   │ →Reconnecting│
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘
//!      │ drives           │                  │
//!      ▼                  ▼                  ▼
//!     Transport::connect() → Link { handle, lifecycle events }
//!
//!     ReconnectOrchestrator: reads SessionStore at startup, spawns a
//!     supervisor per previously paired device (≤3 bulk passes), and
//!     re-runs the reload whenever the 10-minute health check finds
//!     registered sessions with none active.
//! ```
//!
//! ### Lifecycle
//! ```text
//! Idle → Connecting → AwaitingPairing → Open → Reconnecting (transient close,
//!                                              5s delay, uncapped retries)
//!                                     → LoggedOut (permanent, torn down)
//!                                     → Failed (anything else before Open,
//!                                               or the 120s connect timeout)
//! ```
//!
//! ## Guarantees
//! - A device is in the active table exactly while its state is `Open`.
//! - The credential blob and the registry entry are removed together on a
//!   permanent logout.
//! - At most one supervisor per device; transitions for one device are
//!   strictly sequential.
//! - A corrupt registry file degrades to an empty registry, never a crash.
//! - One device's fault (including a panic) is isolated from all others.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkvisor::{Config, ReconnectOrchestrator, SessionManager, Transport};
//!
//! # fn transport() -> Arc<dyn Transport> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SessionManager::new(Config::default(), transport())?;
//!
//!     // Recover previously paired sessions and keep them healthy.
//!     ReconnectOrchestrator::new(Arc::clone(&manager)).spawn();
//!
//!     // Application-facing operations:
//!     let mut events = manager.subscribe_events("alice").await;
//!     manager.request_connect("alice", "6281111").await?;
//!     while let Some(ev) = events.recv().await {
//!         println!("{}", serde_json::to_string(&ev)?);
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod error;
mod events;
mod store;
mod transport;

// ---- Public re-exports ----

pub use config::Config;
pub use crate::core::{
    format_pairing_code, LinkState, ReconnectOrchestrator, SessionInfo, SessionManager,
};
pub use error::SessionError;
pub use events::{Event, EventBus, EventKind, SessionStatus};
pub use store::{ActiveTable, CredentialStore, SessionStore};
pub use transport::{CloseCode, Link, LinkEvent, LinkHandle, Transport};
