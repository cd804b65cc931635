//! Wire transport seam
//!
//! The transport knows how to move typed messages to and from one kernel;
//! it knows nothing about discovery or session lifecycle. Framing, signing,
//! and socket patterns live behind this trait.

use crate::connection_file::ConnectionFile;
use crate::error::Result;
use crate::messages::WireMessage;
use async_trait::async_trait;
use std::time::Duration;

/// Factory for wire connections to launched kernels
#[async_trait]
pub trait WireTransport: Send + Sync {
    /// Open a connection to the kernel addressed by `connection`
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the kernel endpoints cannot be reached.
    async fn connect(&self, connection: &ConnectionFile) -> Result<Box<dyn WireConnection>>;
}

/// A live, bidirectional connection to one kernel
///
/// Messages from all inbound channels (shell/control replies and `IOPub`
/// broadcasts) are delivered through `recv` in wire order.
#[async_trait]
pub trait WireConnection: Send + Sync {
    /// Send one message on its channel
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the connection is unusable.
    async fn send(&self, message: WireMessage) -> Result<()>;

    /// Receive the next inbound message; `None` once the peer is gone
    ///
    /// # Errors
    ///
    /// Returns `Transport` on wire-level failures.
    async fn recv(&self) -> Result<Option<WireMessage>>;

    /// Ping the heartbeat channel, bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns `Transport` on wire-level failures; an unanswered ping is
    /// `Ok(false)`.
    async fn heartbeat(&self, timeout: Duration) -> Result<bool>;

    /// Close the connection; idempotent
    ///
    /// # Errors
    ///
    /// Returns `Transport` when teardown fails.
    async fn shutdown(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn WireConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn WireConnection")
    }
}
