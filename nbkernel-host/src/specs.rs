//! Kernel spec loading and normalization
//!
//! Reads one `kernel.json` from disk into a normalized [`KernelSpec`].
//! Loading is lenient: malformed or stale specs are skipped (and the paths
//! remembered as invalid until cache eviction) so one broken registration
//! never hides the rest of the host's kernels.

use dashmap::DashSet;
use nbkernel_core::kernelspec::{spec_name_for_interpreter, HostBookkeeping};
use nbkernel_core::{HostError, Interpreter, KernelSpec, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Directory name kernels are archived into when a registration from an
/// older installation is retired
pub const ARCHIVE_DIR_NAME: &str = "__old_nbkernel_kernelspecs";

/// Loads and normalizes kernel spec files
pub struct SpecLoader {
    invalid_paths: DashSet<PathBuf>,
}

impl SpecLoader {
    /// Create a loader with an empty invalid-path memo
    pub fn new() -> Self {
        Self {
            invalid_paths: DashSet::new(),
        }
    }

    /// Load the spec at `path`, normalized and bound to `interpreter` when
    /// one is supplied
    ///
    /// Returns `None` for specs that must not surface: malformed files,
    /// archived specs, registrations whose declared interpreter is gone,
    /// and specs with an empty launch line.
    pub async fn load_spec(
        &self,
        path: &Path,
        interpreter: Option<&Interpreter>,
    ) -> Option<KernelSpec> {
        if is_archived(path) {
            trace!("Skipping archived spec {}", path.display());
            return None;
        }
        if self.invalid_paths.contains(path) {
            trace!("Skipping known-invalid spec {}", path.display());
            return None;
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(error) => {
                debug!("Failed to read spec {}: {}", path.display(), error);
                return None;
            }
        };

        let mut spec = match parse_spec(&content, path) {
            Ok(spec) => spec,
            Err(error) => {
                warn!("{error}");
                self.invalid_paths.insert(path.to_path_buf());
                return None;
            }
        };

        if spec.argv.is_empty() {
            warn!("Spec {} has an empty argv; skipping", path.display());
            self.invalid_paths.insert(path.to_path_buf());
            return None;
        }

        // A registration that declares its interpreter is stale once that
        // interpreter is gone from disk.
        if let Some(declared) = spec.metadata_interpreter_path() {
            if !tokio::fs::try_exists(declared).await.unwrap_or(false) {
                debug!(
                    "Spec {} declares missing interpreter {}; skipping",
                    path.display(),
                    declared.display()
                );
                return None;
            }
        }

        normalize(&mut spec, path, interpreter);
        Some(spec)
    }

    /// Forget remembered invalid paths (cache eviction)
    pub fn evict(&self) {
        self.invalid_paths.clear();
    }
}

impl Default for SpecLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse spec content strictly
///
/// # Errors
///
/// Returns `Parse` with the offending path on malformed content.
pub fn parse_spec(content: &str, path: &Path) -> Result<KernelSpec> {
    serde_json::from_str(content).map_err(|error| HostError::parse(path, error.to_string()))
}

fn normalize(spec: &mut KernelSpec, path: &Path, interpreter: Option<&Interpreter>) {
    spec.spec_file = Some(path.to_path_buf());

    let directory_name = path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if spec.name.is_empty() {
        spec.name.clone_from(&directory_name);
    }
    if spec.display_name.is_empty() {
        spec.display_name.clone_from(&directory_name);
    }

    let bookkeeping = spec.metadata.nbkernel.get_or_insert_with(HostBookkeeping::default);
    if bookkeeping.original_spec_file.is_none() {
        bookkeeping.original_spec_file = Some(path.to_path_buf());
    }

    if let Some(interpreter) = interpreter {
        if bookkeeping.original_display_name.is_none() {
            bookkeeping.original_display_name = Some(spec.display_name.clone());
        }
        // Two interpreters must never alias on spec name.
        spec.name = spec_name_for_interpreter(&interpreter.path);
        if spec.language.eq_ignore_ascii_case("python") {
            spec.display_name.clone_from(&interpreter.display_name);
        }
    }
}

/// True when `path` sits inside an archive directory
fn is_archived(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::Normal(name) if name == ARCHIVE_DIR_NAME))
}
