//! # Active connection table.
//!
//! In-memory mapping of device id → live [`LinkHandle`]. A device appears
//! here exactly while its connection state is `Open`; the owning supervisor
//! inserts on `Open` and removes on any close. The table exists only while
//! the process runs and is rebuilt by the reconnect orchestrator at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::transport::LinkHandle;

/// In-memory registry of open links, keyed by device id.
#[derive(Default)]
pub struct ActiveTable {
    links: RwLock<HashMap<String, Arc<dyn LinkHandle>>>,
}

impl ActiveTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) the live handle for `device`.
    pub async fn insert(&self, device: &str, handle: Arc<dyn LinkHandle>) {
        self.links.write().await.insert(device.to_string(), handle);
    }

    /// Removes the handle for `device`, returning it if present.
    pub async fn remove(&self, device: &str) -> Option<Arc<dyn LinkHandle>> {
        self.links.write().await.remove(device)
    }

    /// Live handle for `device`, if it is open.
    pub async fn get(&self, device: &str) -> Option<Arc<dyn LinkHandle>> {
        self.links.read().await.get(device).cloned()
    }

    /// True if `device` currently has an open link.
    pub async fn contains(&self, device: &str) -> bool {
        self.links.read().await.contains_key(device)
    }

    /// Number of open links.
    pub async fn count(&self) -> usize {
        self.links.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::SessionError;

    struct NullHandle;

    #[async_trait]
    impl LinkHandle for NullHandle {
        async fn request_pairing_code(&self, _device: &str) -> Result<String, SessionError> {
            Ok(String::new())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let table = ActiveTable::new();
        assert_eq!(table.count().await, 0);

        table.insert("6281111", Arc::new(NullHandle)).await;
        assert!(table.contains("6281111").await);
        assert!(table.get("6281111").await.is_some());
        assert_eq!(table.count().await, 1);

        assert!(table.remove("6281111").await.is_some());
        assert!(!table.contains("6281111").await);
        assert!(table.remove("6281111").await.is_none());
    }
}
