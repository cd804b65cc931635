//! nbkernel command-line interface
//!
//! Composes the host services explicitly and exposes discovery and
//! selection, plus an end-to-end session demo against the in-process
//! kernel. Production embeddings supply their own wire transport; the CLI
//! only needs one for the demo.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nbkernel_core::{InterpreterService, KernelConnection, KeyValueStore, WireTransport};
use nbkernel_host::interpreters::SystemInterpreterService;
use nbkernel_host::logging::{init_logging, LoggingConfig};
use nbkernel_host::ranking::NotebookMetadata;
use nbkernel_host::sessions::{Session, SessionFacade, SessionOwner};
use nbkernel_host::state::{MemoryStore, SledStore};
use nbkernel_host::transport::{InProcessKernel, InProcessTransport};
use nbkernel_host::{CacheUsage, HostConfig, KernelLauncher, LocalKernelIndex, Services};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nbkernel", version, about = "Notebook kernel discovery and sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List kernels discovered on this host
    List {
        /// Skip the persisted cache and force a fresh scan
        #[arg(long)]
        fresh: bool,
    },
    /// Show the preferred kernel for a notebook file
    Find {
        /// Path to an .ipynb file
        notebook: PathBuf,
    },
    /// Run one snippet against the in-process demo kernel
    Demo {
        /// Code to execute
        #[arg(default_value = "1 + 1")]
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&LoggingConfig::default());

    let cli = Cli::parse();
    let config = Arc::new(HostConfig::load().await?);
    let store: Arc<dyn KeyValueStore> = match &config.store_path {
        Some(path) => Arc::new(SledStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let interpreters: Arc<dyn InterpreterService> = Arc::new(SystemInterpreterService::new());
    let transport: Arc<dyn WireTransport> =
        Arc::new(InProcessTransport::with_factory(InProcessKernel::new));

    let services = Services {
        config: Arc::clone(&config),
        interpreters,
        store,
        transport,
    };

    match cli.command {
        Command::List { fresh } => list_kernels(&services, fresh).await,
        Command::Find { notebook } => find_kernel(&services, &notebook).await,
        Command::Demo { code } => run_demo(&services, &code).await,
    }
}

async fn list_kernels(services: &Services, fresh: bool) -> Result<()> {
    let index = LocalKernelIndex::new(services);
    let usage = if fresh {
        CacheUsage::IgnoreCache
    } else {
        CacheUsage::UseCache
    };
    let cancel = CancellationToken::new();
    let connections = index.list_kernels(None, usage, &cancel).await?;

    if connections.is_empty() {
        println!("No kernels found.");
        return Ok(());
    }
    for connection in &connections {
        println!("{}", describe(connection));
    }
    Ok(())
}

async fn find_kernel(services: &Services, notebook: &PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(notebook)
        .await
        .with_context(|| format!("failed to read {}", notebook.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&content).with_context(|| "notebook is not valid JSON")?;
    let metadata = document
        .get("metadata")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let metadata = NotebookMetadata::from_json(metadata, notebook)?;

    let index = LocalKernelIndex::new(services);
    let cancel = CancellationToken::new();
    match index
        .find_kernel(Some(notebook.as_path()), &metadata, &cancel)
        .await?
    {
        Some(connection) => println!("{}", describe(&connection)),
        None => println!("No matching kernel."),
    }
    Ok(())
}

async fn run_demo(services: &Services, code: &str) -> Result<()> {
    if !cfg!(unix) {
        anyhow::bail!("the demo session requires a Unix host");
    }

    // A real child process stands in for the kernel side of the wire; the
    // in-process kernel answers the protocol.
    let spec = nbkernel_core::KernelSpec {
        name: "demo".to_string(),
        display_name: "Demo kernel".to_string(),
        language: "python".to_string(),
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 600".to_string()],
        env: std::collections::HashMap::new(),
        interrupt_mode: nbkernel_core::InterruptMode::Signal,
        metadata: nbkernel_core::SpecMetadata::default(),
        interpreter_path: None,
        spec_file: None,
    };
    let connection = KernelConnection::Spec {
        spec,
        interpreter: None,
    };

    let launcher = Arc::new(KernelLauncher::new(
        Arc::clone(&services.config),
        Arc::clone(&services.interpreters),
        Arc::clone(&services.transport),
    ));
    let core = nbkernel_host::SessionCore::new(
        connection,
        Arc::clone(&services.config),
        launcher,
        None,
        None,
        SessionOwner::InteractiveWindow,
    )?;
    let session: Arc<dyn Session> = core;
    let facade = SessionFacade::new(session);

    let cancel = CancellationToken::new();
    let mut messages = facade.subscribe_messages();
    facade.connect(&cancel).await?;

    let reply = facade.execute_request(code, &cancel).await?;
    while let Ok(message) = messages.try_recv() {
        if message.header.msg_type == "execute_result" {
            if let Some(text) = message.content["data"]["text/plain"].as_str() {
                println!("{text}");
            }
        }
    }
    println!(
        "execute_reply: {}",
        reply.content["status"].as_str().unwrap_or("unknown")
    );

    facade.shutdown().await?;
    Ok(())
}

fn describe(connection: &KernelConnection) -> String {
    let kind = match connection {
        KernelConnection::Spec { .. } => "spec",
        KernelConnection::PythonInterpreter { .. } => "interpreter",
        KernelConnection::Live { .. } => "live",
    };
    let language = connection
        .spec()
        .map_or("unknown", |spec| spec.language.as_str());
    format!(
        "{:<40} {:<12} {:<10} {}",
        connection.display_name(),
        kind,
        language,
        connection.id()
    )
}
