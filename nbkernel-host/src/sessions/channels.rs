//! Shared session surface
//!
//! The state both session kinds (local process, remote live kernel)
//! compose: the status watch, the `IOPub` broadcast, the dispose event,
//! request/response multiplexing, and the comm-target / message-hook
//! registries. Because the registries live here rather than in the kernel
//! attachment, they survive a restart swap untouched.

use dashmap::DashMap;
use nbkernel_core::{
    Channel, HostError, KernelStatus, Result, WireConnection, WireMessage,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Hook over inbound broadcast messages; returning `true` swallows the
/// message before subscribers see it
pub type MessageHook = dyn Fn(&WireMessage) -> bool + Send + Sync;

/// Handler for messages arriving on a registered comm target
pub type CommHandler = dyn Fn(&WireMessage) + Send + Sync;

/// Capacity of the broadcast channel fanning out kernel messages
const BROADCAST_CAPACITY: usize = 256;

/// Channel surface shared by every session implementation
pub struct SessionChannels {
    client_id: String,
    status_tx: watch::Sender<KernelStatus>,
    messages_tx: broadcast::Sender<WireMessage>,
    dispose_tx: watch::Sender<bool>,
    pending: DashMap<String, oneshot::Sender<WireMessage>>,
    comm_targets: DashMap<String, Arc<CommHandler>>,
    /// comm id → target name, learned from `comm_open`
    comm_instances: DashMap<String, String>,
    message_hooks: Mutex<Vec<(u64, Arc<MessageHook>)>>,
    next_hook_id: AtomicU64,
    disposed: AtomicBool,
}

impl SessionChannels {
    /// Create the surface for a session identified by `client_id`
    pub fn new(client_id: String) -> Arc<Self> {
        let (status_tx, _) = watch::channel(KernelStatus::Unknown);
        let (messages_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (dispose_tx, _) = watch::channel(false);
        Arc::new(Self {
            client_id,
            status_tx,
            messages_tx,
            dispose_tx,
            pending: DashMap::new(),
            comm_targets: DashMap::new(),
            comm_instances: DashMap::new(),
            message_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }

    /// Client id stamped on outgoing messages; survives restarts
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current session status
    pub fn status(&self) -> KernelStatus {
        *self.status_tx.borrow()
    }

    /// Watch status transitions; `Dead` is final
    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to broadcast kernel messages (`IOPub` and stdin)
    pub fn subscribe_messages(&self) -> broadcast::Receiver<WireMessage> {
        self.messages_tx.subscribe()
    }

    /// Watch the dispose event; flips to `true` exactly once
    pub fn watch_dispose(&self) -> watch::Receiver<bool> {
        self.dispose_tx.subscribe()
    }

    /// True once the session reached `Dead`
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Move to `status`; transitions out of `Dead` are ignored
    pub fn set_status(&self, status: KernelStatus) {
        let current = *self.status_tx.borrow();
        if current.is_terminal() || current == status {
            return;
        }
        trace!("Session {} status {current} -> {status}", self.client_id);
        let _ = self.status_tx.send_replace(status);
    }

    /// Fire the dispose event; returns `true` only on the first call
    pub fn mark_disposed(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.dispose_tx.send_replace(true);
        true
    }

    /// Send `message` over `wire` and await its reply
    ///
    /// # Errors
    ///
    /// - `SessionDisposed` when the session is already dead, or dies
    ///   while the request is in flight
    /// - `Cancelled` when `cancel` fires first; the response waiter is
    ///   detached
    pub async fn track_request(
        &self,
        wire: &dyn WireConnection,
        message: WireMessage,
        cancel: &CancellationToken,
    ) -> Result<WireMessage> {
        if self.is_disposed() {
            return Err(HostError::SessionDisposed);
        }

        let msg_id = message.header.msg_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(msg_id.clone(), reply_tx);

        if let Err(error) = wire.send(message).await {
            self.pending.remove(&msg_id);
            return Err(error);
        }

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| HostError::SessionDisposed),
            () = cancel.cancelled() => {
                self.pending.remove(&msg_id);
                Err(HostError::Cancelled)
            }
        }
    }

    /// Drop every in-flight response waiter (session death)
    pub fn fail_pending(&self) {
        self.pending.clear();
    }

    /// Route one inbound message to waiters, hooks, comm handlers, and
    /// subscribers
    pub fn route(&self, message: WireMessage) {
        match message.channel {
            Channel::Shell | Channel::Control => {
                if let Some(parent_id) = message.parent_msg_id() {
                    if let Some((_, waiter)) = self.pending.remove(parent_id) {
                        let _ = waiter.send(message);
                        return;
                    }
                }
                debug!(
                    "Dropping unsolicited {} reply on {}",
                    message.header.msg_type, message.channel
                );
            }
            Channel::Iopub => {
                if self.run_hooks(&message) {
                    return;
                }
                self.route_comm(&message);
                if let Some(state) = message.execution_state() {
                    self.apply_execution_state(state);
                }
                let _ = self.messages_tx.send(message);
            }
            Channel::Stdin => {
                let _ = self.messages_tx.send(message);
            }
            Channel::Heartbeat => {}
        }
    }

    fn apply_execution_state(&self, state: nbkernel_core::messages::ExecutionState) {
        use nbkernel_core::messages::ExecutionState;
        // Busy/idle flips only apply to a connected session; startup and
        // teardown own their own transitions.
        if !self.status().is_connected() {
            return;
        }
        match state {
            ExecutionState::Busy => self.set_status(KernelStatus::Busy),
            ExecutionState::Idle => self.set_status(KernelStatus::Idle),
            ExecutionState::Starting => {}
        }
    }

    /// True when a registered hook swallowed the message
    fn run_hooks(&self, message: &WireMessage) -> bool {
        let hooks: Vec<Arc<MessageHook>> = self
            .message_hooks
            .lock()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        hooks.iter().any(|hook| hook(message))
    }

    fn route_comm(&self, message: &WireMessage) {
        let target_name = match message.header.msg_type.as_str() {
            "comm_open" => {
                let Some(target) = message
                    .content
                    .get("target_name")
                    .and_then(|target| target.as_str())
                else {
                    return;
                };
                if let Some(comm_id) = message
                    .content
                    .get("comm_id")
                    .and_then(|comm_id| comm_id.as_str())
                {
                    self.comm_instances
                        .insert(comm_id.to_string(), target.to_string());
                }
                target.to_string()
            }
            "comm_msg" | "comm_close" => {
                let Some(comm_id) = message
                    .content
                    .get("comm_id")
                    .and_then(|comm_id| comm_id.as_str())
                else {
                    return;
                };
                let Some(target) = self.comm_instances.get(comm_id) else {
                    return;
                };
                let target = target.value().clone();
                if message.header.msg_type == "comm_close" {
                    self.comm_instances.remove(comm_id);
                }
                target
            }
            _ => return,
        };

        if let Some(handler) = self.comm_targets.get(&target_name) {
            handler.value()(message);
        }
    }

    /// Register a handler for comm messages on `target_name`
    pub fn register_comm_target(&self, target_name: impl Into<String>, handler: Arc<CommHandler>) {
        self.comm_targets.insert(target_name.into(), handler);
    }

    /// Remove the handler for `target_name`
    pub fn remove_comm_target(&self, target_name: &str) {
        self.comm_targets.remove(target_name);
    }

    /// Register a message hook; the returned id removes it
    pub fn register_message_hook(&self, hook: Arc<MessageHook>) -> u64 {
        let id = self.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.message_hooks.lock().push((id, hook));
        id
    }

    /// Remove a message hook by id; returns whether it existed
    pub fn remove_message_hook(&self, id: u64) -> bool {
        let mut hooks = self.message_hooks.lock();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn iopub(msg_type: &str, content: serde_json::Value) -> WireMessage {
        WireMessage::request(msg_type, content, "kernel", Channel::Iopub)
    }

    #[test]
    fn test_status_never_leaves_dead() {
        let channels = SessionChannels::new("c1".to_string());
        channels.set_status(KernelStatus::Starting);
        channels.set_status(KernelStatus::Idle);
        channels.set_status(KernelStatus::Dead);
        channels.set_status(KernelStatus::Idle);
        assert_eq!(channels.status(), KernelStatus::Dead);
    }

    #[test]
    fn test_dispose_fires_once() {
        let channels = SessionChannels::new("c1".to_string());
        let watcher = channels.watch_dispose();
        assert!(channels.mark_disposed());
        assert!(!channels.mark_disposed());
        assert!(*watcher.borrow());
    }

    #[test]
    fn test_busy_idle_only_while_connected() {
        let channels = SessionChannels::new("c1".to_string());
        channels.route(iopub("status", json!({"execution_state": "busy"})));
        // Not connected yet: ignored
        assert_eq!(channels.status(), KernelStatus::Unknown);

        channels.set_status(KernelStatus::Starting);
        channels.set_status(KernelStatus::Idle);
        channels.route(iopub("status", json!({"execution_state": "busy"})));
        assert_eq!(channels.status(), KernelStatus::Busy);
        channels.route(iopub("status", json!({"execution_state": "idle"})));
        assert_eq!(channels.status(), KernelStatus::Idle);
    }

    #[test]
    fn test_message_hook_can_swallow() {
        let channels = SessionChannels::new("c1".to_string());
        let mut subscriber = channels.subscribe_messages();

        let hook_id = channels.register_message_hook(Arc::new(|message: &WireMessage| {
            message.header.msg_type == "stream"
        }));

        channels.route(iopub("stream", json!({"name": "stdout", "text": "hidden"})));
        assert!(subscriber.try_recv().is_err());

        channels.remove_message_hook(hook_id);
        channels.route(iopub("stream", json!({"name": "stdout", "text": "visible"})));
        assert_eq!(subscriber.try_recv().unwrap().header.msg_type, "stream");
    }

    #[test]
    fn test_comm_routing_follows_comm_id() {
        let channels = SessionChannels::new("c1".to_string());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channels.register_comm_target(
            "widget",
            Arc::new(move |message: &WireMessage| {
                sink.lock().push(message.header.msg_type.clone());
            }),
        );

        channels.route(iopub(
            "comm_open",
            json!({"comm_id": "abc", "target_name": "widget", "data": {}}),
        ));
        channels.route(iopub("comm_msg", json!({"comm_id": "abc", "data": {}})));
        channels.route(iopub("comm_close", json!({"comm_id": "abc", "data": {}})));
        // After close the comm id is forgotten
        channels.route(iopub("comm_msg", json!({"comm_id": "abc", "data": {}})));

        assert_eq!(
            seen.lock().clone(),
            vec!["comm_open", "comm_msg", "comm_close"]
        );
    }

    #[tokio::test]
    async fn test_fail_pending_surfaces_session_disposed() {
        let channels = SessionChannels::new("c1".to_string());
        let (reply_tx, reply_rx) = oneshot::channel::<WireMessage>();
        channels.pending.insert("m1".to_string(), reply_tx);
        channels.fail_pending();
        assert!(reply_rx.await.is_err());
    }

    /// Wire that accepts sends and never produces a reply
    struct SilentWire;

    #[async_trait::async_trait]
    impl WireConnection for SilentWire {
        async fn send(&self, _message: WireMessage) -> nbkernel_core::Result<()> {
            Ok(())
        }

        async fn recv(&self) -> nbkernel_core::Result<Option<WireMessage>> {
            std::future::pending().await
        }

        async fn heartbeat(&self, _timeout: std::time::Duration) -> nbkernel_core::Result<bool> {
            Ok(true)
        }

        async fn shutdown(&self) -> nbkernel_core::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_detaches_the_response_waiter() {
        let channels = SessionChannels::new("c1".to_string());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let message = WireMessage::request(
            "execute_request",
            json!({"code": "loop {}"}),
            "c1",
            Channel::Shell,
        );
        let error = channels
            .track_request(&SilentWire, message, &cancel)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "cancelled");
        assert!(channels.pending.is_empty(), "waiter must be detached");
    }
}
