//! Runtime core: session orchestration and lifecycle.
//!
//! The public API from this module is [`SessionManager`] (the operations the
//! surrounding application consumes) and [`ReconnectOrchestrator`] (startup
//! bulk reconnect plus the periodic health check).
//!
//! Internal modules:
//! - [`supervisor`]: per-device connection state machine over the transport's
//!   lifecycle event stream;
//! - [`manager`]: shared registries, input validation, the single-supervisor
//!   guard, and panic isolation for supervisor tasks;
//! - [`orchestrator`]: bulk-reload passes with a bounded budget and the
//!   self-healing health-check loop.

mod manager;
mod orchestrator;
mod supervisor;

pub use manager::{SessionInfo, SessionManager};
pub use orchestrator::ReconnectOrchestrator;
pub use supervisor::{format_pairing_code, LinkState};
