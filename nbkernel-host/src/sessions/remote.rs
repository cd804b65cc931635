//! Remote live-kernel session
//!
//! Counterpart of [`SessionCore`](crate::sessions::SessionCore) for
//! kernels already running on a remote server. Lifecycle diverges from
//! local sessions: there is no child process, restart is always forwarded
//! to the server, and shutdown only reaches the server when the ownership
//! policy allows it.

use crate::sessions::channels::SessionChannels;
use crate::sessions::{can_shutdown, Session, SessionOwner};
use async_trait::async_trait;
use nbkernel_core::{
    Channel, HostError, KernelConnection, KernelStatus, Result, WireConnection, WireMessage,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Server operations a remote session forwards to
#[async_trait]
pub trait RemoteSessionApi: Send + Sync {
    /// Open a wire connection to the remote kernel
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the server cannot be reached.
    async fn connect(&self, kernel_id: &str) -> Result<Box<dyn WireConnection>>;

    /// Ask the server to restart the kernel
    ///
    /// # Errors
    ///
    /// Returns `Transport` on server failure.
    async fn restart(&self, kernel_id: &str) -> Result<()>;

    /// Ask the server to shut the kernel down
    ///
    /// # Errors
    ///
    /// Returns `Transport` on server failure.
    async fn shutdown(&self, kernel_id: &str) -> Result<()>;
}

/// Session attached to a kernel on a remote server
pub struct RemoteSession {
    weak: Weak<Self>,
    connection: KernelConnection,
    kernel_id: String,
    api: Arc<dyn RemoteSessionApi>,
    owner: SessionOwner,
    channels: Arc<SessionChannels>,
    attachment: tokio::sync::Mutex<Option<(Arc<dyn WireConnection>, JoinHandle<()>)>>,
    shutting_down: AtomicBool,
    interrupt_timeout: Duration,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("kernel_id", &self.kernel_id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Create a session for a `Live` connection
    ///
    /// # Errors
    ///
    /// Returns `InvalidKernel` for local connection variants.
    pub fn new(
        connection: KernelConnection,
        api: Arc<dyn RemoteSessionApi>,
        owner: SessionOwner,
        interrupt_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let KernelConnection::Live { model, .. } = &connection else {
            return Err(HostError::InvalidKernel {
                reason: "local kernels are run by a local session".to_string(),
            });
        };
        let kernel_id = model.id.clone();
        let client_id = Uuid::new_v4().to_string();
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            connection,
            kernel_id,
            api,
            owner,
            channels: SessionChannels::new(client_id),
            attachment: tokio::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            interrupt_timeout,
        }))
    }

    async fn current_wire(&self) -> Result<Arc<dyn WireConnection>> {
        self.attachment
            .lock()
            .await
            .as_ref()
            .map(|(wire, _)| Arc::clone(wire))
            .ok_or_else(|| HostError::transport("session is not connected"))
    }

    /// Teardown shared by shutdown and server-side disconnect
    async fn dispose_local(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((wire, dispatch)) = self.attachment.lock().await.take() {
            let _ = wire.shutdown().await;
            dispatch.abort();
        }
        self.channels.fail_pending();
        self.channels.set_status(KernelStatus::Terminating);
        self.channels.set_status(KernelStatus::Dead);
        self.channels.mark_disposed();
    }
}

#[async_trait]
impl Session for RemoteSession {
    fn channels(&self) -> &Arc<SessionChannels> {
        &self.channels
    }

    fn connection(&self) -> &KernelConnection {
        &self.connection
    }

    #[instrument(level = "info", skip(self, _cancel), fields(kernel = %self.kernel_id))]
    async fn connect(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        if self.attachment.lock().await.is_some() {
            return Ok(());
        }

        self.channels.set_status(KernelStatus::Starting);
        let wire: Arc<dyn WireConnection> = match self.api.connect(&self.kernel_id).await {
            Ok(wire) => Arc::from(wire),
            Err(error) => {
                self.channels.set_status(KernelStatus::Dead);
                self.channels.mark_disposed();
                return Err(error);
            }
        };

        let weak = self.weak.clone();
        let channels = Arc::clone(&self.channels);
        let dispatch_wire = Arc::clone(&wire);
        let dispatch = tokio::spawn(async move {
            loop {
                match dispatch_wire.recv().await {
                    Ok(Some(message)) => channels.route(message),
                    Ok(None) | Err(_) => break,
                }
            }
            if let Some(session) = weak.upgrade() {
                if !session.channels.is_disposed() {
                    warn!("Remote kernel {} went away", session.kernel_id);
                    session.dispose_local().await;
                }
            }
        });

        *self.attachment.lock().await = Some((wire, dispatch));
        self.channels.set_status(KernelStatus::Idle);
        Ok(())
    }

    async fn request(
        &self,
        msg_type: &str,
        content: serde_json::Value,
        channel: Channel,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        let wire = self.current_wire().await?;
        let message = WireMessage::request(msg_type, content, self.channels.client_id(), channel);
        self.channels.track_request(&*wire, message, cancel).await
    }

    async fn post(&self, msg_type: &str, content: serde_json::Value, channel: Channel)
        -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        let wire = self.current_wire().await?;
        let message = WireMessage::request(msg_type, content, self.channels.client_id(), channel);
        wire.send(message).await
    }

    async fn interrupt(&self, cancel: &CancellationToken) -> Result<()> {
        // Remote kernels have no signal path; interrupt is always a
        // message round trip.
        let request = self.request("interrupt_request", json!({}), Channel::Shell, cancel);
        match tokio::time::timeout(self.interrupt_timeout, request).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(HostError::InterruptTimeout {
                timeout: self.interrupt_timeout,
            }),
        }
    }

    async fn restart(&self, cancel: &CancellationToken) -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled);
        }
        // Always forwarded, regardless of how the spec was registered.
        self.api.restart(&self.kernel_id).await
    }

    async fn shutdown(&self) -> Result<()> {
        if can_shutdown(&self.connection, self.owner) {
            if let Err(error) = self.api.shutdown(&self.kernel_id).await {
                debug!("Remote shutdown of {} failed: {error}", self.kernel_id);
            }
        } else {
            debug!(
                "Leaving remote kernel {} running (owner policy)",
                self.kernel_id
            );
        }
        self.dispose_local().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessKernel, InProcessTransport};
    use nbkernel_core::connection::LiveKernelModel;
    use nbkernel_core::{ConnectionFile, WireTransport};
    use std::sync::atomic::AtomicU32;

    struct FakeServer {
        transport: InProcessTransport,
        connection_file: ConnectionFile,
        restarts: AtomicU32,
        shutdowns: AtomicU32,
    }

    impl FakeServer {
        fn new() -> Arc<Self> {
            let transport = InProcessTransport::new();
            let kernel = InProcessKernel::new();
            let mut connection_file = ConnectionFile::new_local(None).unwrap();
            connection_file.key = "remote-kernel".to_string();
            transport.register(&connection_file.key, kernel);
            Arc::new(Self {
                transport,
                connection_file,
                restarts: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteSessionApi for FakeServer {
        async fn connect(&self, _kernel_id: &str) -> Result<Box<dyn WireConnection>> {
            self.transport.connect(&self.connection_file).await
        }

        async fn restart(&self, _kernel_id: &str) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, _kernel_id: &str) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn live_connection() -> KernelConnection {
        KernelConnection::Live {
            model: LiveKernelModel {
                id: "k1".to_string(),
                name: "python3".to_string(),
                display_name: Some("Remote Python".to_string()),
            },
            base_url: "http://hub:8888".to_string(),
        }
    }

    fn session(server: &Arc<FakeServer>, owner: SessionOwner) -> Arc<RemoteSession> {
        let api: Arc<dyn RemoteSessionApi> = server.clone();
        RemoteSession::new(live_connection(), api, owner, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_and_request_round_trip() {
        let server = FakeServer::new();
        let session = session(&server, SessionOwner::Notebook);

        let cancel = CancellationToken::new();
        session.connect(&cancel).await.unwrap();
        assert_eq!(session.channels().status(), KernelStatus::Idle);

        let reply = session
            .request(
                "kernel_info_request",
                serde_json::json!({}),
                Channel::Shell,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(reply.header.msg_type, "kernel_info_reply");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_is_always_forwarded() {
        let server = FakeServer::new();
        let session = session(&server, SessionOwner::Notebook);

        let cancel = CancellationToken::new();
        session.connect(&cancel).await.unwrap();
        session.restart(&cancel).await.unwrap();
        assert_eq!(server.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notebook_owned_remote_kernel_is_retained_on_shutdown() {
        let server = FakeServer::new();
        let session = session(&server, SessionOwner::Notebook);

        let cancel = CancellationToken::new();
        session.connect(&cancel).await.unwrap();
        session.shutdown().await.unwrap();

        // The server-side kernel keeps running; the local session dies.
        assert_eq!(server.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(session.channels().status(), KernelStatus::Dead);
        let error = session
            .request(
                "kernel_info_request",
                serde_json::json!({}),
                Channel::Shell,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "session-disposed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interactive_window_remote_kernel_is_shut_down() {
        let server = FakeServer::new();
        let session = session(&server, SessionOwner::InteractiveWindow);

        let cancel = CancellationToken::new();
        session.connect(&cancel).await.unwrap();
        session.shutdown().await.unwrap();
        assert_eq!(server.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_connection_is_rejected() {
        let server = FakeServer::new();
        let spec = nbkernel_core::KernelSpec {
            name: "python3".to_string(),
            display_name: "Python 3".to_string(),
            language: "python".to_string(),
            argv: vec!["python3".to_string()],
            env: std::collections::HashMap::new(),
            interrupt_mode: nbkernel_core::InterruptMode::Signal,
            metadata: nbkernel_core::SpecMetadata::default(),
            interpreter_path: None,
            spec_file: None,
        };
        let api: Arc<dyn RemoteSessionApi> = server;
        let error = RemoteSession::new(
            KernelConnection::Spec {
                spec,
                interpreter: None,
            },
            api,
            SessionOwner::Notebook,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(error.code(), "invalid-kernel");
    }
}
