//! Local session core
//!
//! A state machine over a single kernel child process:
//!
//! ```text
//! Unknown → Starting → Idle ⇄ Busy
//!                        ↓
//!                    Terminating → Dead
//! Unknown → Starting → Dead   (launch failure)
//! ```
//!
//! All message dispatch for one session is serialized on one task. The
//! restart path swaps a pre-warmed spare kernel into the live slot so the
//! caller-visible channels (and `client_id`) never change.

use crate::config::HostConfig;
use crate::launch::{ExitInfo, KernelLauncher, KernelProcess};
use crate::sessions::channels::SessionChannels;
use crate::sessions::{Session, SessionOwner};
use async_trait::async_trait;
use metrics::counter;
use nbkernel_core::{
    Channel, HostError, InterruptMode, KernelConnection, KernelStatus, Result, WireConnection,
    WireMessage,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Ceiling on one startup-probe attempt
const STARTUP_PROBE_CAP: Duration = Duration::from_secs(10);

/// Startup-probe attempts before giving up
const STARTUP_PROBE_ATTEMPTS: u32 = 2;

/// Grace period for the kernel to honor `shutdown_request`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A launched, probed kernel not yet wired to a session's channels
pub struct LaunchedKernel {
    process: KernelProcess,
    wire: Arc<dyn WireConnection>,
}

struct Attachment {
    process: KernelProcess,
    wire: Arc<dyn WireConnection>,
    dispatch: JoinHandle<()>,
}

/// Session over a local kernel child process
pub struct SessionCore {
    weak: Weak<Self>,
    connection: KernelConnection,
    config: Arc<HostConfig>,
    launcher: Arc<KernelLauncher>,
    resource: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    owner: SessionOwner,
    channels: Arc<SessionChannels>,
    attachment: tokio::sync::Mutex<Option<Attachment>>,
    restart_spare: tokio::sync::Mutex<Option<LaunchedKernel>>,
    /// Bumped on attach/detach; a dispatch task whose generation is stale
    /// must not drive exit handling
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl SessionCore {
    /// Create a session for a local kernel connection
    ///
    /// # Errors
    ///
    /// Returns `InvalidKernel` for `Live` connections; those are managed
    /// by a remote session of the same shape.
    pub fn new(
        connection: KernelConnection,
        config: Arc<HostConfig>,
        launcher: Arc<KernelLauncher>,
        resource: Option<PathBuf>,
        working_dir: Option<PathBuf>,
        owner: SessionOwner,
    ) -> Result<Arc<Self>> {
        if !connection.is_local() {
            return Err(HostError::InvalidKernel {
                reason: "live remote kernels are not run by a local session".to_string(),
            });
        }
        let client_id = Uuid::new_v4().to_string();
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            connection,
            config,
            launcher,
            resource,
            working_dir,
            owner,
            channels: SessionChannels::new(client_id),
            attachment: tokio::sync::Mutex::new(None),
            restart_spare: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// Owner deciding the shutdown policy for this session
    pub const fn owner(&self) -> SessionOwner {
        self.owner
    }

    /// Launch the kernel, connect the wire, and run the startup probe
    async fn start_kernel(&self, cancel: &CancellationToken) -> Result<LaunchedKernel> {
        let process = self
            .launcher
            .launch(
                &self.connection,
                self.config.launch_timeout(),
                self.resource.as_deref(),
                self.working_dir.as_deref(),
                cancel,
            )
            .await?;

        let wire: Arc<dyn WireConnection> = Arc::from(
            self.launcher
                .transport()
                .connect(process.connection_file())
                .await?,
        );

        match self.startup_probe(&*wire, cancel).await {
            Ok(()) => Ok(LaunchedKernel { process, wire }),
            Err(error) => {
                let _ = wire.shutdown().await;
                process.dispose();
                Err(error)
            }
        }
    }

    /// Send `kernel_info_request` until both the reply and some `IOPub`
    /// traffic are observed
    ///
    /// First messages from a freshly started kernel can get dropped
    /// before its subscriptions settle, so the probe retries once and
    /// treats `IOPub` silence as not-ready.
    async fn startup_probe(
        &self,
        wire: &dyn WireConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let budget = self.config.launch_timeout().min(STARTUP_PROBE_CAP);

        for attempt in 1..=STARTUP_PROBE_ATTEMPTS {
            let request = WireMessage::request(
                "kernel_info_request",
                json!({}),
                self.channels.client_id(),
                Channel::Shell,
            );
            let request_id = request.header.msg_id.clone();
            wire.send(request).await?;

            let deadline = tokio::time::sleep(budget);
            tokio::pin!(deadline);
            let mut got_reply = false;
            let mut got_iopub = false;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return Err(HostError::Cancelled),
                    () = &mut deadline => break,
                    received = wire.recv() => match received? {
                        Some(message) => {
                            if message.channel == Channel::Iopub {
                                got_iopub = true;
                            }
                            if message.header.msg_type == "kernel_info_reply"
                                && message.parent_msg_id() == Some(request_id.as_str())
                            {
                                got_reply = true;
                            }
                            if got_reply && got_iopub {
                                debug!("Startup probe satisfied on attempt {attempt}");
                                return Ok(());
                            }
                        }
                        None => {
                            return Err(HostError::KernelDied {
                                exit_code: None,
                                reason: Some(
                                    "kernel closed the connection during startup".to_string(),
                                ),
                            });
                        }
                    }
                }
            }
            debug!("Startup probe attempt {attempt} timed out");
        }

        Err(HostError::LaunchTimeout { timeout: budget })
    }

    /// Wire `kernel` into this session's channels; returns the previous
    /// attachment when swapping
    async fn attach(&self, kernel: LaunchedKernel) -> Option<Attachment> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let dispatch = tokio::spawn(dispatch_loop(
            self.weak.clone(),
            Arc::clone(&self.channels),
            Arc::clone(&kernel.wire),
            kernel.process.exit_watch(),
            generation,
        ));
        self.attachment.lock().await.replace(Attachment {
            process: kernel.process,
            wire: kernel.wire,
            dispatch,
        })
    }

    /// React to the child exiting while this session is still live
    async fn handle_abrupt_exit(&self, generation: u64, info: Option<ExitInfo>) {
        if self.generation.load(Ordering::SeqCst) != generation || self.channels.is_disposed() {
            return;
        }
        warn!(
            "Kernel process for session {} exited unexpectedly ({:?})",
            self.channels.client_id(),
            info.as_ref().and_then(|info| info.exit_code),
        );
        self.channels.set_status(KernelStatus::Terminating);
        self.shutdown_internal(false).await;
    }

    /// Best-effort teardown; idempotent and infallible
    async fn shutdown_internal(&self, send_request: bool) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Detach exit handling before anything else so the dispatch task
        // cannot re-enter the shutdown path.
        self.generation.fetch_add(1, Ordering::SeqCst);

        let attachment = self.attachment.lock().await.take();
        if let Some(attachment) = attachment {
            if send_request {
                let request = WireMessage::request(
                    "shutdown_request",
                    json!({"restart": false}),
                    self.channels.client_id(),
                    Channel::Control,
                );
                let cancel_token = CancellationToken::new();
                let reply = self.channels.track_request(
                    &*attachment.wire,
                    request,
                    &cancel_token,
                );
                if tokio::time::timeout(SHUTDOWN_GRACE, reply).await.is_err() {
                    debug!("Kernel did not acknowledge shutdown_request in time");
                }
            }
            // Closing the wire ends the dispatch loop on its own; it must
            // not be aborted here because the abrupt-exit path runs this
            // function from the dispatch task itself. The bumped
            // generation keeps the ending loop from re-entering shutdown.
            let _ = attachment.wire.shutdown().await;
            drop(attachment.dispatch);
            attachment.process.dispose();
        }

        if let Some(spare) = self.restart_spare.lock().await.take() {
            let _ = spare.wire.shutdown().await;
            spare.process.dispose();
        }

        self.channels.fail_pending();
        self.channels.set_status(KernelStatus::Terminating);
        self.channels.set_status(KernelStatus::Dead);
        if self.channels.mark_disposed() {
            counter!("session_dead").increment(1);
            info!("Session {} disposed", self.channels.client_id());
        }
    }

    /// Spawn an opportunistic restart spare in the background
    fn maybe_prewarm(&self) {
        if !self.config.prewarm_restart_sessions {
            return;
        }
        let Some(core) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if core.channels.is_disposed() || core.restart_spare.lock().await.is_some() {
                return;
            }
            match core.start_kernel(&CancellationToken::new()).await {
                Ok(kernel) => {
                    let mut slot = core.restart_spare.lock().await;
                    if core.channels.is_disposed() || slot.is_some() {
                        drop(slot);
                        let _ = kernel.wire.shutdown().await;
                        kernel.process.dispose();
                    } else {
                        debug!(
                            "Pre-warmed restart session ready for {}",
                            core.channels.client_id()
                        );
                        *slot = Some(kernel);
                    }
                }
                Err(error) => debug!("Pre-warm launch failed: {error}"),
            }
        });
    }

    /// The current wire connection, when attached
    async fn current_wire(&self) -> Result<Arc<dyn WireConnection>> {
        self.attachment
            .lock()
            .await
            .as_ref()
            .map(|attachment| Arc::clone(&attachment.wire))
            .ok_or_else(|| HostError::transport("session is not connected"))
    }
}

#[async_trait]
impl Session for SessionCore {
    fn channels(&self) -> &Arc<SessionChannels> {
        &self.channels
    }

    fn connection(&self) -> &KernelConnection {
        &self.connection
    }

    #[instrument(level = "info", skip(self, cancel), fields(kernel = self.connection.display_name()))]
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        if self.attachment.lock().await.is_some() {
            return Ok(());
        }

        self.channels.set_status(KernelStatus::Starting);
        match self.start_kernel(cancel).await {
            Ok(kernel) => {
                self.attach(kernel).await;
                self.channels.set_status(KernelStatus::Idle);
                self.maybe_prewarm();
                Ok(())
            }
            Err(error) => {
                // Launch failure is terminal: Starting → Dead.
                self.channels.set_status(KernelStatus::Dead);
                self.channels.mark_disposed();
                Err(error)
            }
        }
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

    async fn post(&self, msg_type: &str, content: serde_json::Value, channel: Channel) -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }
        let wire = self.current_wire().await?;
        let message = WireMessage::request(msg_type, content, self.channels.client_id(), channel);
        wire.send(message).await
    }

    async fn interrupt(&self, cancel: &CancellationToken) -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }

        {
            let attachment = self.attachment.lock().await;
            let Some(attachment) = attachment.as_ref() else {
                return Err(HostError::transport("session is not connected"));
            };
            if attachment.process.can_interrupt() {
                return attachment.process.interrupt();
            }
        }

        let interrupt_mode = self
            .connection
            .spec()
            .map_or(InterruptMode::Signal, |spec| spec.interrupt_mode);
        if interrupt_mode != InterruptMode::Message {
            return Err(HostError::InterruptNotSupported);
        }

        let budget = self.config.interrupt_timeout();
        let request = self.request("interrupt_request", json!({}), Channel::Shell, cancel);
        match tokio::time::timeout(budget, request).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(HostError::InterruptTimeout { timeout: budget }),
        }
    }

    #[instrument(level = "info", skip(self, cancel), fields(session = self.channels.client_id()))]
    async fn restart(&self, cancel: &CancellationToken) -> Result<()> {
        if self.channels.is_disposed() {
            return Err(HostError::SessionDisposed);
        }

        // Consume the pre-warmed spare, or start one now (blocking).
        let replacement = match self.restart_spare.lock().await.take() {
            Some(spare) => spare,
            None => self.start_kernel(cancel).await?,
        };

        self.channels.set_status(KernelStatus::Starting);
        let old = self.attach(replacement).await;
        self.channels.set_status(KernelStatus::Idle);
        counter!("session_restart").increment(1);

        if let Some(old) = old {
            // Old kernel goes down in the background; errors are logged,
            // never propagated to the restart caller.
            let client_id = self.channels.client_id().to_string();
            tokio::spawn(async move {
                let request = WireMessage::request(
                    "shutdown_request",
                    json!({"restart": false}),
                    client_id,
                    Channel::Control,
                );
                let _ = old.wire.send(request).await;
                old.dispatch.abort();
                if let Err(error) = old.wire.shutdown().await {
                    debug!("Old wire teardown failed: {error}");
                }
                old.process.dispose();
            });
        }

        self.maybe_prewarm();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_internal(true).await;
        Ok(())
    }
}

/// Per-session dispatch: reads the wire in order, routes messages, and
/// watches for process exit
async fn dispatch_loop(
    core: Weak<SessionCore>,
    channels: Arc<SessionChannels>,
    wire: Arc<dyn WireConnection>,
    mut exit_rx: watch::Receiver<Option<ExitInfo>>,
    generation: u64,
) {
    let exit_info = loop {
        tokio::select! {
            received = wire.recv() => match received {
                Ok(Some(message)) => channels.route(message),
                Ok(None) | Err(_) => break None,
            },
            changed = exit_rx.changed() => {
                let info = exit_rx.borrow().clone();
                if changed.is_err() || info.is_some() {
                    break info;
                }
            }
        }
    };

    if let Some(core) = core.upgrade() {
        core.handle_abrupt_exit(generation, exit_info).await;
    }
}
