//! Remote kernel discovery seam
//!
//! Server-hosted kernel discovery lives outside this crate but shares the
//! local finder's shape, so selection can rank local and remote candidates
//! uniformly.

use crate::connection::KernelConnection;
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Finder producing `Live` connections for kernels on a remote server
#[async_trait]
pub trait RemoteKernelFinder: Send + Sync {
    /// List kernels currently running on the remote server
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the server cannot be reached and
    /// `Cancelled` when `cancel` fires first.
    async fn list_kernels(&self, cancel: &CancellationToken) -> Result<Vec<KernelConnection>>;

    /// Base URL of the server this finder talks to
    fn base_url(&self) -> &str;
}
