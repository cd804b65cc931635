//! In-process transport and scripted kernel endpoint
//!
//! Connects session machinery to a kernel living in the same process over
//! tokio channels, with no sockets involved. The scripted
//! [`InProcessKernel`] answers the wire protocol the way a real kernel
//! does (kernel-info, execute, interrupt, shutdown) and is the workhorse
//! of the session test suites.

use async_trait::async_trait;
use dashmap::DashMap;
use nbkernel_core::{
    Channel, ConnectionFile, HostError, Result, WireConnection, WireMessage, WireTransport,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Tunable behavior of a scripted kernel
#[derive(Debug, Clone)]
pub struct InProcessKernelBehavior {
    /// Swallow the first `kernel_info_request` (exercises the startup
    /// probe's retry)
    pub drop_first_kernel_info: bool,
    /// Count interrupt requests but never acknowledge them
    pub ignore_interrupts: bool,
    /// Delay before answering execute requests
    pub execute_delay: Duration,
}

impl Default for InProcessKernelBehavior {
    fn default() -> Self {
        Self {
            drop_first_kernel_info: false,
            ignore_interrupts: false,
            execute_delay: Duration::ZERO,
        }
    }
}

/// A kernel endpoint living in this process
///
/// Holds no execution engine; it replies to protocol traffic with
/// plausible content and counts what it sees.
pub struct InProcessKernel {
    session_id: String,
    behavior: InProcessKernelBehavior,
    alive: AtomicBool,
    kernel_info_requests: AtomicU32,
    interrupt_requests: AtomicU32,
    execution_count: AtomicU32,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WireMessage>>>,
}

impl InProcessKernel {
    /// Create a kernel with default behavior
    pub fn new() -> Arc<Self> {
        Self::with_behavior(InProcessKernelBehavior::default())
    }

    /// Create a kernel with scripted behavior
    pub fn with_behavior(behavior: InProcessKernelBehavior) -> Arc<Self> {
        Arc::new(Self {
            session_id: "inprocess-kernel".to_string(),
            behavior,
            alive: AtomicBool::new(true),
            kernel_info_requests: AtomicU32::new(0),
            interrupt_requests: AtomicU32::new(0),
            execution_count: AtomicU32::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Number of `interrupt_request` messages seen
    pub fn interrupt_requests(&self) -> u32 {
        self.interrupt_requests.load(Ordering::SeqCst)
    }

    /// Number of `kernel_info_request` messages seen
    pub fn kernel_info_requests(&self) -> u32 {
        self.kernel_info_requests.load(Ordering::SeqCst)
    }

    /// Simulate abrupt kernel death: connections see end-of-stream
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
    }

    /// True until [`kill`](Self::kill) or a shutdown request
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn attach(&self, sender: mpsc::UnboundedSender<WireMessage>) {
        self.subscribers.lock().push(sender);
    }

    fn publish(&self, message: WireMessage) {
        self.subscribers
            .lock()
            .retain(|sender| sender.send(message.clone()).is_ok());
    }

    fn publish_status(&self, state: &str, parent: &WireMessage) {
        self.publish(WireMessage::reply_to(
            parent,
            "status",
            json!({"execution_state": state}),
            Channel::Iopub,
        ));
    }

    fn handle(self: &Arc<Self>, message: WireMessage) {
        if !self.is_alive() {
            return;
        }
        trace!(
            "In-process kernel received {} on {}",
            message.header.msg_type,
            message.channel
        );
        match message.header.msg_type.as_str() {
            "kernel_info_request" => self.handle_kernel_info(&message),
            "execute_request" => self.handle_execute(message),
            "interrupt_request" => self.handle_interrupt(&message),
            "shutdown_request" => self.handle_shutdown(&message),
            "inspect_request" | "complete_request" | "debug_request" => {
                let reply_type = message.header.msg_type.replace("_request", "_reply");
                let reply =
                    WireMessage::reply_to(&message, reply_type, json!({"status": "ok"}), message.channel);
                self.publish(reply);
            }
            "input_reply" => {}
            other => debug!("In-process kernel ignoring {other}"),
        }
    }

    fn handle_kernel_info(self: &Arc<Self>, request: &WireMessage) {
        let seen = self.kernel_info_requests.fetch_add(1, Ordering::SeqCst);
        if seen == 0 && self.behavior.drop_first_kernel_info {
            debug!("In-process kernel dropping first kernel_info_request");
            return;
        }
        self.publish_status("busy", request);
        self.publish(WireMessage::reply_to(
            request,
            "kernel_info_reply",
            json!({
                "status": "ok",
                "protocol_version": nbkernel_core::PROTOCOL_VERSION,
                "implementation": "nbkernel-inprocess",
                "language_info": {"name": "python"},
            }),
            Channel::Shell,
        ));
        self.publish_status("idle", request);
    }

    fn handle_execute(self: &Arc<Self>, request: WireMessage) {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            kernel.publish_status("busy", &request);
            if !kernel.behavior.execute_delay.is_zero() {
                tokio::time::sleep(kernel.behavior.execute_delay).await;
            }
            if !kernel.is_alive() {
                return;
            }

            let count = kernel.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
            let code = request
                .content
                .get("code")
                .and_then(|code| code.as_str())
                .unwrap_or_default()
                .to_string();
            kernel.publish(WireMessage::reply_to(
                &request,
                "execute_result",
                json!({
                    "execution_count": count,
                    "data": {"text/plain": format!("ran: {code}")},
                    "metadata": {},
                }),
                Channel::Iopub,
            ));
            kernel.publish_status("idle", &request);
            kernel.publish(WireMessage::reply_to(
                &request,
                "execute_reply",
                json!({"status": "ok", "execution_count": count}),
                Channel::Shell,
            ));
        });
    }

    fn handle_interrupt(&self, request: &WireMessage) {
        self.interrupt_requests.fetch_add(1, Ordering::SeqCst);
        if self.behavior.ignore_interrupts {
            return;
        }
        self.publish(WireMessage::reply_to(
            request,
            "interrupt_reply",
            json!({"status": "ok"}),
            request.channel,
        ));
        self.publish_status("idle", request);
    }

    fn handle_shutdown(&self, request: &WireMessage) {
        self.publish(WireMessage::reply_to(
            request,
            "shutdown_reply",
            json!({"status": "ok", "restart": false}),
            request.channel,
        ));
        self.alive.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
    }
}

/// Factory producing a kernel endpoint per launched connection file
pub type KernelFactory = dyn Fn() -> Arc<InProcessKernel> + Send + Sync;

/// Transport connecting to in-process kernels by connection-file key
///
/// Every connection file written by a launch carries a fresh HMAC key, so
/// the key doubles as the kernel-instance identity: the first connect for
/// a key materializes a kernel (through the factory, when one is set) and
/// later connects for the same key share it.
#[derive(Default)]
pub struct InProcessTransport {
    kernels: DashMap<String, Arc<InProcessKernel>>,
    factory: Mutex<Option<Arc<KernelFactory>>>,
    created: Mutex<Vec<Arc<InProcessKernel>>>,
}

impl InProcessTransport {
    /// Create a transport with no registered kernels; connects fail until
    /// kernels are registered explicitly
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that materializes one kernel per launched
    /// connection file
    pub fn with_factory(factory: impl Fn() -> Arc<InProcessKernel> + Send + Sync + 'static) -> Self {
        let transport = Self::new();
        *transport.factory.lock() = Some(Arc::new(factory));
        transport
    }

    /// Register `kernel` under the HMAC key of a connection file
    pub fn register(&self, key: &str, kernel: Arc<InProcessKernel>) {
        self.kernels.insert(key.to_string(), kernel);
    }

    /// Remove the kernel registered under `key`
    pub fn unregister(&self, key: &str) {
        self.kernels.remove(key);
    }

    /// Kernels materialized by the factory, in creation order
    pub fn created(&self) -> Vec<Arc<InProcessKernel>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl WireTransport for InProcessTransport {
    async fn connect(&self, connection: &ConnectionFile) -> Result<Box<dyn WireConnection>> {
        let existing = self
            .kernels
            .get(&connection.key)
            .map(|entry| Arc::clone(entry.value()));
        let kernel = match existing {
            Some(kernel) => kernel,
            None => {
                let factory = self.factory.lock().clone();
                match factory {
                    Some(factory) => {
                        let kernel = self
                            .kernels
                            .entry(connection.key.clone())
                            .or_insert_with(|| {
                                let kernel = factory();
                                self.created.lock().push(Arc::clone(&kernel));
                                kernel
                            })
                            .value()
                            .clone();
                        kernel
                    }
                    None => {
                        return Err(HostError::transport(format!(
                            "no in-process kernel registered for key {}",
                            &connection.key
                        )))
                    }
                }
            }
        };

        let (to_client, from_kernel) = mpsc::unbounded_channel();
        kernel.attach(to_client);
        Ok(Box::new(InProcessConnection {
            kernel,
            from_kernel: tokio::sync::Mutex::new(from_kernel),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One client connection to an in-process kernel
struct InProcessConnection {
    kernel: Arc<InProcessKernel>,
    from_kernel: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireMessage>>,
    closed: AtomicBool,
}

#[async_trait]
impl WireConnection for InProcessConnection {
    async fn send(&self, message: WireMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::transport("connection is closed"));
        }
        self.kernel.handle(message);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<WireMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut receiver = self.from_kernel.lock().await;
        Ok(receiver.recv().await)
    }

    async fn heartbeat(&self, _timeout: Duration) -> Result<bool> {
        Ok(self.kernel.is_alive() && !self.closed.load(Ordering::SeqCst))
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.from_kernel.lock().await.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_file_for(key: &str) -> ConnectionFile {
        let mut connection = ConnectionFile::new_local(None).unwrap();
        connection.key = key.to_string();
        connection
    }

    #[tokio::test]
    async fn test_kernel_info_round_trip() {
        let transport = InProcessTransport::new();
        let kernel = InProcessKernel::new();
        transport.register("k1", Arc::clone(&kernel));

        let wire = transport.connect(&connection_file_for("k1")).await.unwrap();
        let request = WireMessage::request(
            "kernel_info_request",
            json!({}),
            "client",
            Channel::Shell,
        );
        let request_id = request.header.msg_id.clone();
        wire.send(request).await.unwrap();

        // busy status, reply, idle status — reply links the request
        let mut saw_reply = false;
        for _ in 0..3 {
            let message = wire.recv().await.unwrap().unwrap();
            if message.header.msg_type == "kernel_info_reply" {
                assert_eq!(message.parent_msg_id(), Some(request_id.as_str()));
                saw_reply = true;
            }
        }
        assert!(saw_reply);
        assert_eq!(kernel.kernel_info_requests(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_key_fails_to_connect() {
        let transport = InProcessTransport::new();
        let error = transport
            .connect(&connection_file_for("missing"))
            .await
            .unwrap_err();
        assert_eq!(error.code(), "transport-error");
    }

    #[tokio::test]
    async fn test_killed_kernel_ends_the_stream() {
        let transport = InProcessTransport::new();
        let kernel = InProcessKernel::new();
        transport.register("k1", Arc::clone(&kernel));

        let wire = transport.connect(&connection_file_for("k1")).await.unwrap();
        kernel.kill();
        assert!(!wire.heartbeat(Duration::from_millis(10)).await.unwrap());
        assert_eq!(wire.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_execute_publishes_result_then_reply() {
        let transport = InProcessTransport::new();
        let kernel = InProcessKernel::new();
        transport.register("k1", Arc::clone(&kernel));

        let wire = transport.connect(&connection_file_for("k1")).await.unwrap();
        wire.send(WireMessage::request(
            "execute_request",
            json!({"code": "1 + 1"}),
            "client",
            Channel::Shell,
        ))
        .await
        .unwrap();

        let mut types = Vec::new();
        while types.last().map(String::as_str) != Some("execute_reply") {
            let message = wire.recv().await.unwrap().unwrap();
            types.push(message.header.msg_type.clone());
        }
        assert!(types.contains(&"execute_result".to_string()));
        assert_eq!(types.last().unwrap(), "execute_reply");
    }
}
