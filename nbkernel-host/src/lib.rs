//! # nbkernel-host
//!
//! Kernel discovery, selection, and session lifecycle for a notebook
//! backend. Given a notebook identity and its metadata, this crate locates
//! the kernels installed on the host, ranks them, launches the selected one
//! as a local child process, and hands back a session facade mediating
//! execute/interrupt/restart/shutdown against that process.
//!
//! ## Architecture
//!
//! Discovery is a union of two finders — one scanning the well-known
//! kernel-spec paths, one walking installed Python interpreters — fronted
//! by [`index::LocalKernelIndex`], which caches results in the host
//! key-value store and selects a preferred kernel per notebook. Launch and
//! session lifecycle live in [`launch`] and [`sessions`]; the wire protocol
//! and interpreter enumeration are consumed through the traits in
//! `nbkernel-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod finders;
pub mod index;
pub mod interpreters;
pub mod launch;
pub mod logging;
pub mod paths;
pub mod ranking;
pub mod sessions;
pub mod specs;
pub mod state;
pub mod transport;

use std::sync::Arc;

use nbkernel_core::{InterpreterService, KeyValueStore, WireTransport};

pub use config::HostConfig;
pub use index::{CacheUsage, LocalKernelIndex};
pub use launch::{KernelLauncher, KernelProcess};
pub use ranking::NotebookMetadata;
pub use sessions::{SessionCore, SessionFacade, SessionOwner};

/// External collaborators the host is composed from
///
/// Constructed once at the binary entry point and threaded through by
/// reference; tests build their own with fakes.
#[derive(Clone)]
pub struct Services {
    /// Host configuration
    pub config: Arc<HostConfig>,
    /// Interpreter enumeration service
    pub interpreters: Arc<dyn InterpreterService>,
    /// Host key-value store
    pub store: Arc<dyn KeyValueStore>,
    /// Wire transport factory
    pub transport: Arc<dyn WireTransport>,
}
