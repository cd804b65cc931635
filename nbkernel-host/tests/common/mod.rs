//! Shared fixtures for the integration suites

#![allow(dead_code)]

use nbkernel_core::kernelspec::{EnvironmentType, InterruptMode, SpecMetadata};
use nbkernel_core::{
    Interpreter, InterpreterService, KernelConnection, KernelSpec, KeyValueStore, WireTransport,
};
use nbkernel_host::interpreters::StaticInterpreterService;
use nbkernel_host::state::MemoryStore;
use nbkernel_host::transport::InProcessTransport;
use nbkernel_host::{HostConfig, KernelLauncher, Services};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config tuned for tests: CI mode, no pre-warming, tight timeouts
pub fn test_config() -> HostConfig {
    HostConfig {
        launch_timeout_secs: 10,
        interrupt_timeout_secs: 2,
        prewarm_restart_sessions: false,
        ci_mode: true,
        log_kernel_output: false,
        store_path: None,
    }
}

/// Compose services over a memory store
pub fn services(
    config: HostConfig,
    interpreters: Arc<dyn InterpreterService>,
    transport: Arc<dyn WireTransport>,
) -> Services {
    Services {
        config: Arc::new(config),
        interpreters,
        store: Arc::new(MemoryStore::new()),
        transport,
    }
}

/// Services with no interpreters and no reachable kernels
pub fn bare_services() -> Services {
    services(
        test_config(),
        Arc::new(StaticInterpreterService::new(Vec::new(), None)),
        Arc::new(InProcessTransport::new()),
    )
}

/// Write `content` as `<root>/<name>/kernel.json`
pub async fn write_spec(root: &Path, name: &str, content: &str) -> PathBuf {
    let dir = root.join(name);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("kernel.json");
    tokio::fs::write(&path, content).await.unwrap();
    path
}

/// An interpreter rooted at `prefix`, with the executable on disk
pub async fn materialize_interpreter(prefix: &Path, display_name: &str) -> Interpreter {
    let path = prefix.join("bin").join("python3");
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, b"").await.unwrap();
    Interpreter {
        path,
        sys_prefix: prefix.to_path_buf(),
        display_name: display_name.to_string(),
        version: None,
        env_type: EnvironmentType::VirtualEnv,
    }
}

/// Local connection whose "kernel" is a long-lived shell child
pub fn sleep_connection(interrupt_mode: InterruptMode) -> KernelConnection {
    KernelConnection::Spec {
        spec: KernelSpec {
            name: "test-kernel".to_string(),
            display_name: "Test kernel".to_string(),
            language: "python".to_string(),
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "sleep 600".to_string(),
            ],
            env: HashMap::new(),
            interrupt_mode,
            metadata: SpecMetadata::default(),
            interpreter_path: None,
            spec_file: None,
        },
        interpreter: None,
    }
}

/// Launcher over the service set
pub fn launcher(services: &Services) -> Arc<KernelLauncher> {
    Arc::new(KernelLauncher::new(
        Arc::clone(&services.config),
        Arc::clone(&services.interpreters),
        Arc::clone(&services.transport),
    ))
}
