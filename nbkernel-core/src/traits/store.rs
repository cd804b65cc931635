//! Host key-value store seam
//!
//! The host process provides a small persistent key-value store. It is
//! single-writer in practice but implementations must tolerate concurrent
//! writers; last write wins.

use crate::error::Result;
use async_trait::async_trait;

/// Host-provided persistent key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the JSON document stored under `key`
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure; a missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Write the JSON document under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    async fn remove(&self, key: &str) -> Result<()>;
}
