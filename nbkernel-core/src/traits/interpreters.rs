//! Interpreter enumeration seam
//!
//! Listing the language environments installed on the host is owned by an
//! external service; discovery consumes it through this trait.

use crate::kernelspec::Interpreter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// External service enumerating installed interpreters
#[async_trait]
pub trait InterpreterService: Send + Sync {
    /// All interpreters known on this host
    async fn list_interpreters(&self) -> Vec<Interpreter>;

    /// The interpreter active for `resource` (workspace-dependent), if any
    async fn active_interpreter(&self, resource: Option<&Path>) -> Option<Interpreter>;

    /// Environment variables produced by activating `interpreter`'s
    /// environment (empty when activation is a no-op)
    async fn activation_env(&self, interpreter: &Interpreter) -> HashMap<String, String>;
}
