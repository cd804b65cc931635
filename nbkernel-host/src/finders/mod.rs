//! Kernel finders
//!
//! Two discovery sources with one output shape: [`KnownPathFinder`] scans
//! the well-known kernel-spec directories independently of any interpreter;
//! [`InterpreterKernelFinder`] walks installed Python environments, matches
//! specs back to their interpreters, and synthesizes connections for
//! environments with no registered spec.

mod interpreters;
mod known_paths;

pub use interpreters::InterpreterKernelFinder;
pub use known_paths::KnownPathFinder;

use std::path::Path;

/// Language whose kernels are re-emitted by the interpreter finder
pub const PYTHON_LANGUAGE: &str = "python";

/// Launcher module written into synthetic specs
pub const DEFAULT_LAUNCH_MODULE: &str = "ipykernel_launcher";

/// Modules that all launch the default Python kernel
///
/// `python -m ipykernel` and `python -m ipykernel_launcher` are the same
/// kernel; registrations use either spelling.
pub const DEFAULT_LAUNCH_MODULES: &[&str] = &["ipykernel_launcher", "ipykernel"];

/// True when `module` is a spelling of the default Python kernel launcher
pub fn is_default_launch_module(module: &str) -> bool {
    DEFAULT_LAUNCH_MODULES.contains(&module)
}

/// Compare two executable paths the way the filesystem does
///
/// Symlinks are resolved when possible; comparison is case-insensitive on
/// Windows and exact elsewhere.
pub(crate) async fn paths_equal(left: &Path, right: &Path) -> bool {
    let left = tokio::fs::canonicalize(left)
        .await
        .unwrap_or_else(|_| left.to_path_buf());
    let right = tokio::fs::canonicalize(right)
        .await
        .unwrap_or_else(|_| right.to_path_buf());
    if cfg!(windows) {
        left.to_string_lossy().to_lowercase() == right.to_string_lossy().to_lowercase()
    } else {
        left == right
    }
}
