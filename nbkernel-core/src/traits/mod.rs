//! Traits through which external collaborators are consumed
//!
//! The host never links against a concrete wire transport, interpreter
//! enumerator, or persistence backend; it talks to these seams. Callers
//! compose concrete implementations at the entry point.

mod interpreters;
mod remote;
mod store;
mod transport;

pub use interpreters::InterpreterService;
pub use remote::RemoteKernelFinder;
pub use store::KeyValueStore;
pub use transport::{WireConnection, WireTransport};
