//! Session lifecycle
//!
//! A session owns one live kernel and mediates every operation against
//! it. Two implementations share one trait: [`SessionCore`] drives a local
//! child process, [`RemoteSession`] a kernel living on a remote server.
//! Both compose the [`SessionChannels`] helper, which carries the
//! caller-visible surface (status, broadcasts, registries) across kernel
//! swaps.

pub mod channels;
pub mod core;
pub mod facade;
pub mod remote;

pub use channels::{CommHandler, MessageHook, SessionChannels};
pub use core::SessionCore;
pub use facade::SessionFacade;
pub use remote::{RemoteSession, RemoteSessionApi};

use async_trait::async_trait;
use nbkernel_core::{Channel, KernelConnection, Result, WireMessage};
use tokio_util::sync::CancellationToken;

/// Who owns a session, deciding its shutdown policy
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionOwner {
    /// A notebook document
    Notebook,
    /// An interactive window
    InteractiveWindow,
    /// A pre-warmed restart spare
    RestartSpare,
}

/// Whether a session's kernel may be shut down by this host
///
/// Restart spares and interactive-window kernels always go down with
/// their session; remote live kernels owned by a notebook are left
/// running on the server.
pub const fn can_shutdown(connection: &KernelConnection, owner: SessionOwner) -> bool {
    match owner {
        SessionOwner::RestartSpare | SessionOwner::InteractiveWindow => true,
        SessionOwner::Notebook => connection.is_local(),
    }
}

/// Operation surface shared by local and remote sessions
#[async_trait]
pub trait Session: Send + Sync {
    /// The shared channel surface (status, broadcasts, registries)
    fn channels(&self) -> &std::sync::Arc<SessionChannels>;

    /// The connection this session runs
    fn connection(&self) -> &KernelConnection;

    /// Start (or attach to) the kernel and reach `Idle`
    ///
    /// # Errors
    ///
    /// Launch-path errors (`LaunchTimeout`, `KernelDied`,
    /// `InterpreterNotInstalled`, `Cancelled`); `SessionDisposed` once
    /// the session is dead.
    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send a request and await its reply
    ///
    /// # Errors
    ///
    /// `SessionDisposed` when dead, `Cancelled` when the caller bails,
    /// `Transport` on wire failure.
    async fn request(
        &self,
        msg_type: &str,
        content: serde_json::Value,
        channel: Channel,
        cancel: &CancellationToken,
    ) -> Result<WireMessage>;

    /// Send a message that has no reply (e.g. `input_reply`)
    ///
    /// # Errors
    ///
    /// `SessionDisposed` when dead, `Transport` on wire failure.
    async fn post(&self, msg_type: &str, content: serde_json::Value, channel: Channel)
        -> Result<()>;

    /// Interrupt the running computation
    ///
    /// # Errors
    ///
    /// `InterruptNotSupported` without a usable interrupt path,
    /// `InterruptTimeout` when unacknowledged in time.
    async fn interrupt(&self, cancel: &CancellationToken) -> Result<()>;

    /// Restart the kernel, preserving the caller-visible surface
    ///
    /// # Errors
    ///
    /// Launch-path errors for local sessions; remote failures for live
    /// kernels.
    async fn restart(&self, cancel: &CancellationToken) -> Result<()>;

    /// Tear the session down; idempotent, never fails
    ///
    /// # Errors
    ///
    /// None in practice; the signature allows implementations to report
    /// teardown diagnostics.
    async fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbkernel_core::connection::LiveKernelModel;
    use nbkernel_core::kernelspec::{InterruptMode, SpecMetadata};
    use nbkernel_core::KernelSpec;
    use std::collections::HashMap;

    fn local_connection() -> KernelConnection {
        KernelConnection::Spec {
            spec: KernelSpec {
                name: "python3".to_string(),
                display_name: "Python 3".to_string(),
                language: "python".to_string(),
                argv: vec!["python3".to_string()],
                env: HashMap::new(),
                interrupt_mode: InterruptMode::Signal,
                metadata: SpecMetadata::default(),
                interpreter_path: None,
                spec_file: None,
            },
            interpreter: None,
        }
    }

    fn live_connection() -> KernelConnection {
        KernelConnection::Live {
            model: LiveKernelModel {
                id: "k1".to_string(),
                name: "python3".to_string(),
                display_name: None,
            },
            base_url: "http://hub:8888".to_string(),
        }
    }

    #[test]
    fn test_can_shutdown_policy() {
        // Restart spares always go down
        assert!(can_shutdown(&live_connection(), SessionOwner::RestartSpare));
        assert!(can_shutdown(&local_connection(), SessionOwner::RestartSpare));

        // Interactive-window kernels always go down
        assert!(can_shutdown(&live_connection(), SessionOwner::InteractiveWindow));
        assert!(can_shutdown(&local_connection(), SessionOwner::InteractiveWindow));

        // Notebook-owned remote live kernels are retained
        assert!(!can_shutdown(&live_connection(), SessionOwner::Notebook));
        assert!(can_shutdown(&local_connection(), SessionOwner::Notebook));
    }
}
