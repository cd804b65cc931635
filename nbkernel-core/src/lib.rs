//! # nbkernel-core
//!
//! Shared data model and collaborator traits for the nbkernel notebook
//! kernel host. This crate defines:
//!
//! - The kernel descriptor model (`KernelSpec`, `Interpreter`,
//!   `KernelConnection`) used by discovery and selection
//! - The connection-file format used to hand transport addressing to a
//!   launched kernel
//! - The wire message model and session status machine
//! - The error taxonomy shared by every host component
//! - Traits through which external collaborators are consumed: the wire
//!   transport, the interpreter enumeration service, the host key-value
//!   store, and remote kernel finders

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod connection;
pub mod connection_file;
pub mod error;
pub mod kernelspec;
pub mod messages;
pub mod traits;

pub use connection::{ConnectionId, KernelConnection, LiveKernelModel};
pub use connection_file::ConnectionFile;
pub use error::{HostError, Result};
pub use kernelspec::{
    interpreter_hash, EnvironmentType, Interpreter, InterpreterVersion, InterruptMode, KernelSpec,
    SpecMetadata,
};
pub use messages::{Channel, KernelStatus, MessageHeader, WireMessage, PROTOCOL_VERSION};
pub use traits::{
    InterpreterService, KeyValueStore, RemoteKernelFinder, WireConnection, WireTransport,
};

/// Placeholder substituted with the connection-file path in kernel `argv`
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";
