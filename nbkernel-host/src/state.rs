//! Key-value store implementations
//!
//! The host consumes persistence through `nbkernel_core::KeyValueStore`.
//! Two backends are provided: an in-memory map for tests and ephemeral
//! runs, and a sled-backed store for real installations. Both tolerate
//! concurrent writers with last-write-wins semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use nbkernel_core::{HostError, KeyValueStore, Result};
use std::path::Path;

/// In-memory store with no persistence
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Sled-backed persistent store
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store at `path`
    ///
    /// # Errors
    ///
    /// Returns `Store` when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|error| HostError::store(error.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(bytes) = self
            .db
            .get(key)
            .map_err(|error| HostError::store(error.to_string()))?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|error| HostError::store(format!("corrupt entry under {key}: {error}")))?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let bytes =
            serde_json::to_vec(&value).map_err(|error| HostError::store(error.to_string()))?;
        self.db
            .insert(key, bytes)
            .map_err(|error| HostError::store(error.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|error| HostError::store(error.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|error| HostError::store(error.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.put("key", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some(json!({"a": 1})));

        store.remove("key").await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);

        // Removing an absent key succeeds
        store.remove("key").await.unwrap();
    }

    #[tokio::test]
    async fn test_sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(&dir.path().join("store")).unwrap();

        store.put("kernels", json!(["a", "b"])).await.unwrap();
        assert_eq!(store.get("kernels").await.unwrap(), Some(json!(["a", "b"])));

        // Last write wins
        store.put("kernels", json!(["c"])).await.unwrap();
        assert_eq!(store.get("kernels").await.unwrap(), Some(json!(["c"])));
    }
}
