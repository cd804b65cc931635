//! Public session surface
//!
//! Thin pass-through over a [`Session`] giving callers the typed request
//! vocabulary (execute, inspect, complete, debug, input replies) plus
//! comm-target and message-hook registration. Registrations live in the
//! shared channel surface, so they survive a restart swap without being
//! re-applied.

use crate::sessions::channels::{CommHandler, MessageHook};
use crate::sessions::Session;
use nbkernel_core::{Channel, KernelStatus, Result, WireMessage};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Caller-facing handle to one session
#[derive(Clone)]
pub struct SessionFacade {
    session: Arc<dyn Session>,
}

impl SessionFacade {
    /// Wrap a session implementation
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Current status
    pub fn status(&self) -> KernelStatus {
        self.session.channels().status()
    }

    /// Watch status transitions
    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.session.channels().watch_status()
    }

    /// Subscribe to broadcast kernel messages
    pub fn subscribe_messages(&self) -> broadcast::Receiver<WireMessage> {
        self.session.channels().subscribe_messages()
    }

    /// Watch the dispose event
    pub fn watch_dispose(&self) -> watch::Receiver<bool> {
        self.session.channels().watch_dispose()
    }

    /// Start the kernel
    ///
    /// # Errors
    ///
    /// See [`Session::connect`].
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.connect(cancel).await
    }

    /// Execute `code` and await the execution reply
    ///
    /// Output arrives through [`subscribe_messages`](Self::subscribe_messages)
    /// while the reply is in flight.
    ///
    /// # Errors
    ///
    /// `SessionDisposed` once the session is dead; see [`Session::request`].
    pub async fn execute_request(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        self.session
            .request(
                "execute_request",
                json!({
                    "code": code,
                    "silent": false,
                    "store_history": true,
                    "user_expressions": {},
                    "allow_stdin": true,
                    "stop_on_error": true,
                }),
                Channel::Shell,
                cancel,
            )
            .await
    }

    /// Inspect the object under the cursor
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn inspect_request(
        &self,
        code: &str,
        cursor_pos: usize,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        self.session
            .request(
                "inspect_request",
                json!({"code": code, "cursor_pos": cursor_pos, "detail_level": 0}),
                Channel::Shell,
                cancel,
            )
            .await
    }

    /// Request completions at the cursor
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn complete_request(
        &self,
        code: &str,
        cursor_pos: usize,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        self.session
            .request(
                "complete_request",
                json!({"code": code, "cursor_pos": cursor_pos}),
                Channel::Shell,
                cancel,
            )
            .await
    }

    /// Forward a debug-adapter request to the kernel
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn debug_request(
        &self,
        content: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        self.session
            .request("debug_request", content, Channel::Control, cancel)
            .await
    }

    /// Answer an `input_request` from the kernel
    ///
    /// # Errors
    ///
    /// See [`Session::post`].
    pub async fn send_input_reply(&self, value: &str) -> Result<()> {
        self.session
            .post("input_reply", json!({"value": value}), Channel::Stdin)
            .await
    }

    /// Interrupt the running computation
    ///
    /// # Errors
    ///
    /// See [`Session::interrupt`].
    pub async fn interrupt(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.interrupt(cancel).await
    }

    /// Restart the kernel; subscriptions and registrations survive
    ///
    /// # Errors
    ///
    /// See [`Session::restart`].
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<()> {
        self.session.restart(cancel).await
    }

    /// Shut the session down; idempotent
    ///
    /// # Errors
    ///
    /// See [`Session::shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.session.shutdown().await
    }

    /// Register a comm-target handler
    pub fn register_comm_target(&self, target_name: impl Into<String>, handler: Arc<CommHandler>) {
        self.session
            .channels()
            .register_comm_target(target_name, handler);
    }

    /// Remove a comm-target handler
    pub fn remove_comm_target(&self, target_name: &str) {
        self.session.channels().remove_comm_target(target_name);
    }

    /// Register a broadcast message hook; the id removes it
    pub fn register_message_hook(&self, hook: Arc<MessageHook>) -> u64 {
        self.session.channels().register_message_hook(hook)
    }

    /// Remove a message hook by id
    pub fn remove_message_hook(&self, id: u64) -> bool {
        self.session.channels().remove_message_hook(id)
    }
}
