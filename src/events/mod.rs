//! Live status events: data model and per-tenant fan-out.
//!
//! ## Contents
//! - [`Event`], [`EventKind`], [`SessionStatus`] — the JSON payloads pushed
//!   to tenant subscribers;
//! - [`EventBus`] — per-tenant channels with at most one active subscriber
//!   per tenant, best-effort delivery, and a periodic keep-alive signal.
//!
//! Events are ephemeral: delivered at most once per subscriber, never
//! persisted, silently dropped when no subscriber is attached.

mod bus;
mod event;

pub use bus::EventBus;
pub use event::{Event, EventKind, SessionStatus};
