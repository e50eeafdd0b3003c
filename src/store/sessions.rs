//! # Durable session registry.
//!
//! [`SessionStore`] persists the tenant → device-set mapping as a single
//! JSON object (tenant id → array of device id strings). It is the source
//! of truth for "should be connected" and survives restarts.
//!
//! ## Rules
//! - An absent file is treated as an empty registry and created on open.
//! - A corrupt file **never** surfaces as a fatal error: it degrades to an
//!   empty registry and is rewritten.
//! - `add_device` / `remove_device` are idempotent; a write to disk happens
//!   only when the in-memory state actually changed.
//! - The file is overwritten atomically (serialize → temp file → rename),
//!   and only after serialization succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SessionError;

type SessionMap = BTreeMap<String, BTreeSet<String>>;

/// Durable mapping of tenant → ordered set of device ids.
pub struct SessionStore {
    path: PathBuf,
    map: Mutex<SessionMap>,
}

impl SessionStore {
    /// Opens the registry at `path`, loading the durable mapping.
    ///
    /// Creates an empty store if the file is absent; resets to empty
    /// (rewriting the file) if it cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let map = Self::load_or_reset(&path)?;
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn load_or_reset(path: &Path) -> Result<SessionMap, SessionError> {
        if !path.exists() {
            debug!(path = %path.display(), "session registry absent, creating empty store");
            write_atomic(path, "{}")?;
            return Ok(SessionMap::new());
        }
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str::<SessionMap>(&raw) {
            Ok(map) => {
                let devices: usize = map.values().map(BTreeSet::len).sum();
                debug!(tenants = map.len(), devices, "session registry loaded");
                Ok(map)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "session registry corrupt, resetting to empty");
                write_atomic(path, "{}")?;
                Ok(SessionMap::new())
            }
        }
    }

    /// Registers `device` under `tenant`. No-op (and no disk write) if the
    /// device is already registered.
    pub async fn add_device(&self, tenant: &str, device: &str) -> Result<(), SessionError> {
        let mut map = self.map.lock().await;
        let inserted = map
            .entry(tenant.to_string())
            .or_default()
            .insert(device.to_string());
        if inserted {
            self.persist(&map)?;
            debug!(tenant, device, "device registered");
        }
        Ok(())
    }

    /// Removes `device` from `tenant`, dropping the tenant entry once its
    /// last device is gone. No-op if the device is absent.
    pub async fn remove_device(&self, tenant: &str, device: &str) -> Result<(), SessionError> {
        let mut map = self.map.lock().await;
        let removed = match map.get_mut(tenant) {
            Some(devices) => {
                let removed = devices.remove(device);
                if devices.is_empty() {
                    map.remove(tenant);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.persist(&map)?;
            debug!(tenant, device, "device deregistered");
        }
        Ok(())
    }

    /// True if `device` is registered under `tenant`.
    pub async fn contains(&self, tenant: &str, device: &str) -> bool {
        self.map
            .lock()
            .await
            .get(tenant)
            .is_some_and(|devices| devices.contains(device))
    }

    /// Device ids registered under `tenant`, in order.
    pub async fn devices_for(&self, tenant: &str) -> Vec<String> {
        self.map
            .lock()
            .await
            .get(tenant)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A copy of the whole mapping.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.map.lock().await.clone()
    }

    /// Total number of registered devices across all tenants.
    pub async fn registered_count(&self) -> usize {
        self.map.lock().await.values().map(BTreeSet::len).sum()
    }

    /// Serializes the mapping and atomically overwrites the durable file.
    ///
    /// The file is only touched after serialization succeeded, so a failed
    /// save never corrupts the previous on-disk state.
    fn persist(&self, map: &SessionMap) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(map)
            .map_err(|err| SessionError::Storage(io::Error::other(err)))?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}

/// Whole-file rewrite via a temp file and rename in the same directory.
fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
