//! Session lifecycle integration tests
//!
//! Sessions run against a real (inert) child process with an in-process
//! kernel answering the wire protocol; the transport materializes one
//! kernel per launch, so restarts get a fresh kernel instance just like
//! real process swaps. Unix-only because children are spawned.

#![cfg(unix)]

mod common;

use common::{launcher, sleep_connection, test_config};
use nbkernel_core::kernelspec::InterruptMode;
use nbkernel_core::{InterpreterService, KernelStatus, WireTransport};
use nbkernel_host::interpreters::StaticInterpreterService;
use nbkernel_host::sessions::{Session, SessionCore, SessionFacade, SessionOwner};
use nbkernel_host::state::MemoryStore;
use nbkernel_host::transport::{InProcessKernel, InProcessKernelBehavior, InProcessTransport};
use nbkernel_host::{HostConfig, Services};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    services: Services,
    transport: Arc<InProcessTransport>,
}

fn fixture(config: HostConfig, behavior: InProcessKernelBehavior) -> Fixture {
    let transport = Arc::new(InProcessTransport::with_factory(move || {
        InProcessKernel::with_behavior(behavior.clone())
    }));
    let dyn_transport: Arc<dyn WireTransport> = transport.clone();
    let interpreters: Arc<dyn InterpreterService> =
        Arc::new(StaticInterpreterService::new(Vec::new(), None));
    Fixture {
        services: Services {
            config: Arc::new(config),
            interpreters,
            store: Arc::new(MemoryStore::new()),
            transport: dyn_transport,
        },
        transport,
    }
}

fn make_session(fixture: &Fixture, interrupt_mode: InterruptMode) -> Arc<SessionCore> {
    SessionCore::new(
        sleep_connection(interrupt_mode),
        Arc::clone(&fixture.services.config),
        launcher(&fixture.services),
        None,
        None,
        SessionOwner::Notebook,
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_execute_shutdown() {
    let fixture = fixture(test_config(), InProcessKernelBehavior::default());
    let session = make_session(&fixture, InterruptMode::Signal);
    let facade = SessionFacade::new(session);

    assert_eq!(facade.status(), KernelStatus::Unknown);
    let cancel = CancellationToken::new();
    facade.connect(&cancel).await.unwrap();
    assert_eq!(facade.status(), KernelStatus::Idle);

    let reply = facade.execute_request("6 * 7", &cancel).await.unwrap();
    assert_eq!(reply.header.msg_type, "execute_reply");
    assert_eq!(reply.content["status"], "ok");

    facade.shutdown().await.unwrap();
    assert_eq!(facade.status(), KernelStatus::Dead);

    // Shutdown is idempotent
    facade.shutdown().await.unwrap();

    // Every operation after Dead fails with SessionDisposed
    let error = facade.execute_request("1", &cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
    let error = facade.interrupt(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
    let error = facade.restart(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
    let error = facade.connect(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_probe_retries_after_dropped_first_message() {
    let mut config = test_config();
    // Keep the per-attempt budget small so the retry happens quickly.
    config.launch_timeout_secs = 2;
    let fixture = fixture(
        config,
        InProcessKernelBehavior {
            drop_first_kernel_info: true,
            ..InProcessKernelBehavior::default()
        },
    );
    let session = make_session(&fixture, InterruptMode::Signal);
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    facade.connect(&cancel).await.unwrap();
    assert_eq!(facade.status(), KernelStatus::Idle);

    let kernels = fixture.transport.created();
    assert!(
        kernels[0].kernel_info_requests() >= 2,
        "probe must have retried"
    );

    facade.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_mode_interrupt_sends_exactly_one_request() {
    let fixture = fixture(test_config(), InProcessKernelBehavior::default());
    let session = make_session(&fixture, InterruptMode::Message);
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    facade.connect(&cancel).await.unwrap();

    facade.interrupt(&cancel).await.unwrap();
    let kernels = fixture.transport.created();
    assert_eq!(kernels[0].interrupt_requests(), 1);

    facade.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unacknowledged_interrupt_times_out_without_state_change() {
    let mut config = test_config();
    config.interrupt_timeout_secs = 1;
    let fixture = fixture(
        config,
        InProcessKernelBehavior {
            ignore_interrupts: true,
            ..InProcessKernelBehavior::default()
        },
    );
    let session = make_session(&fixture, InterruptMode::Message);
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    facade.connect(&cancel).await.unwrap();

    let error = facade.interrupt(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "interrupt-timeout");
    // The failed interrupt leaves the session usable
    assert_eq!(facade.status(), KernelStatus::Idle);
    let reply = facade.execute_request("still alive", &cancel).await.unwrap();
    assert_eq!(reply.content["status"], "ok");

    facade.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_preserves_client_id_and_subscriptions() {
    let mut config = test_config();
    config.prewarm_restart_sessions = true;
    let fixture = fixture(config, InProcessKernelBehavior::default());
    let session = make_session(&fixture, InterruptMode::Signal);
    let client_id_before = session.channels().client_id().to_string();
    let facade = SessionFacade::new(session.clone());

    let cancel = CancellationToken::new();
    let mut messages = facade.subscribe_messages();
    facade.connect(&cancel).await.unwrap();

    facade.restart(&cancel).await.unwrap();
    assert_eq!(facade.status(), KernelStatus::Idle);
    assert_eq!(session.channels().client_id(), client_id_before);

    // The swapped-in kernel is a different instance
    assert!(fixture.transport.created().len() >= 2);

    // The pre-restart subscription still observes the swapped kernel
    let reply = facade
        .execute_request("after restart", &cancel)
        .await
        .unwrap();
    assert_eq!(reply.content["status"], "ok");
    let mut saw_result = false;
    while let Ok(message) = messages.try_recv() {
        if message.header.msg_type == "execute_result" {
            saw_result = true;
        }
    }
    assert!(saw_result, "subscription survived the swap");

    facade.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abrupt_kernel_death_propagates() {
    let fixture = fixture(test_config(), InProcessKernelBehavior::default());
    let session = make_session(&fixture, InterruptMode::Signal);
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    let mut dispose_watch = facade.watch_dispose();
    facade.connect(&cancel).await.unwrap();

    fixture.transport.created()[0].kill();

    tokio::time::timeout(Duration::from_secs(1), async {
        while !*dispose_watch.borrow() {
            dispose_watch.changed().await.unwrap();
        }
    })
    .await
    .expect("dispose fires within a second of kernel death");

    assert_eq!(facade.status(), KernelStatus::Dead);
    let error = facade.execute_request("1", &cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_failure_is_terminal() {
    let mut config = test_config();
    config.launch_timeout_secs = 1;
    // No factory: the wire never connects, so readiness cannot be met.
    let transport = Arc::new(InProcessTransport::new());
    let dyn_transport: Arc<dyn WireTransport> = transport;
    let interpreters: Arc<dyn InterpreterService> =
        Arc::new(StaticInterpreterService::new(Vec::new(), None));
    let fixture = Fixture {
        services: Services {
            config: Arc::new(config),
            interpreters,
            store: Arc::new(MemoryStore::new()),
            transport: dyn_transport,
        },
        transport: Arc::new(InProcessTransport::new()),
    };

    let session = make_session(&fixture, InterruptMode::Signal);
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    let error = facade.connect(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "launch-timeout");
    assert_eq!(facade.status(), KernelStatus::Dead);

    let error = facade.connect(&cancel).await.unwrap_err();
    assert_eq!(error.code(), "session-disposed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_comm_targets_and_hooks_survive_restart() {
    let fixture = fixture(test_config(), InProcessKernelBehavior::default());
    let session = make_session(&fixture, InterruptMode::Signal);
    let facade = SessionFacade::new(session.clone());

    let cancel = CancellationToken::new();
    facade.connect(&cancel).await.unwrap();

    let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    facade.register_comm_target(
        "widget",
        Arc::new(move |_message: &nbkernel_core::WireMessage| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
    );
    let hook_id =
        facade.register_message_hook(Arc::new(|_message: &nbkernel_core::WireMessage| false));

    facade.restart(&cancel).await.unwrap();

    // Registrations are still in place on the swapped kernel
    assert!(facade.remove_message_hook(hook_id));
    session.channels().route(nbkernel_core::WireMessage::request(
        "comm_open",
        serde_json::json!({"comm_id": "c1", "target_name": "widget", "data": {}}),
        "kernel",
        nbkernel_core::Channel::Iopub,
    ));
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);

    facade.shutdown().await.unwrap();
}
