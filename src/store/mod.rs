//! Durable and in-memory session state.
//!
//! Three registries, each with single-writer discipline per key:
//! - [`SessionStore`]: durable tenant → device-set mapping (JSON file,
//!   atomic whole-file rewrite); source of truth for "should be connected";
//! - [`CredentialStore`]: per-device credential blobs on disk; blob
//!   existence is the sole "previously paired" signal;
//! - [`ActiveTable`]: in-memory device → live link handle; exists only
//!   while the process runs and is rebuilt from the durable stores at
//!   startup.

mod active;
mod creds;
mod sessions;

pub use active::ActiveTable;
pub use creds::CredentialStore;
pub use sessions::SessionStore;
