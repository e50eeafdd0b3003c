//! # Credential blob storage.
//!
//! One directory per (tenant, device) holding the opaque authentication
//! state the transport needs to reconnect without re-pairing:
//!
//! ```text
//! <auth_dir>/users/<tenant>/device<device>/creds.json
//! ```
//!
//! The blob's existence is the sole "previously paired" signal: the
//! reconnect orchestrator skips devices without one, and the supervisor
//! requests a pairing code only when one is missing.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SessionError;

const CREDS_FILE: &str = "creds.json";

/// Filesystem store for per-device credential blobs.
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the blob for `(tenant, device)`.
    pub fn dir_for(&self, tenant: &str, device: &str) -> PathBuf {
        self.root
            .join("users")
            .join(tenant)
            .join(format!("device{device}"))
    }

    /// True if a credential blob was persisted for `(tenant, device)`,
    /// i.e. the device paired at least once.
    pub fn is_paired(&self, tenant: &str, device: &str) -> bool {
        self.dir_for(tenant, device).join(CREDS_FILE).exists()
    }

    /// Persists fresh credential material, creating the directory as needed.
    ///
    /// Writes via a temp file and rename so a crash mid-write never leaves
    /// a truncated blob behind.
    pub fn persist(&self, tenant: &str, device: &str, blob: &[u8]) -> Result<(), SessionError> {
        let dir = self.dir_for(tenant, device);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CREDS_FILE);
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &path)?;
        debug!(tenant, device, "credentials persisted");
        Ok(())
    }

    /// Deletes the device's credential directory recursively.
    ///
    /// No-op if the directory is already gone.
    pub fn purge(&self, tenant: &str, device: &str) -> Result<(), SessionError> {
        let dir = self.dir_for(tenant, device);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            debug!(tenant, device, "credentials purged");
        }
        Ok(())
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}
