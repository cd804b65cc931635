//! Discovery over installed Python interpreters
//!
//! Walks each interpreter's `share/jupyter/kernels` prefix, matches specs
//! back to the interpreter that owns them, and synthesizes a default
//! kernel connection for every environment that has no registered spec.

use crate::finders::{
    is_default_launch_module, paths_equal, DEFAULT_LAUNCH_MODULE, PYTHON_LANGUAGE,
};
use crate::specs::SpecLoader;
use futures::future::join_all;
use nbkernel_core::kernelspec::{spec_name_for_interpreter, HostBookkeeping};
use nbkernel_core::{
    HostError, Interpreter, InterpreterService, InterruptMode, KernelConnection, KernelSpec,
    Result, SpecMetadata, CONNECTION_FILE_PLACEHOLDER,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Display names of ambiguous "default" registrations suppressed when any
/// interpreter is present
const DEFAULT_DISPLAY_NAMES: &[&str] = &["Python 3 (ipykernel)", "Python 2 (ipykernel)"];

/// Finds kernels through installed Python interpreters
pub struct InterpreterKernelFinder {
    interpreters: Arc<dyn InterpreterService>,
    loader: Arc<SpecLoader>,
}

impl InterpreterKernelFinder {
    /// Create a finder over the given interpreter service and loader
    pub fn new(interpreters: Arc<dyn InterpreterService>, loader: Arc<SpecLoader>) -> Self {
        Self {
            interpreters,
            loader,
        }
    }

    /// List kernels for every known interpreter
    ///
    /// `global_specs` are the known-path results; Python specs among them
    /// that use a non-default launch module are re-examined here because
    /// they need their matching interpreter for environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires during the scan.
    #[instrument(level = "debug", skip_all)]
    pub async fn list_kernels(
        &self,
        global_specs: &[KernelConnection],
        resource: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Vec<KernelConnection>> {
        let interpreters = self.interpreters.list_interpreters().await;
        let active = self.interpreters.active_interpreter(resource).await;
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled);
        }

        let mut candidates = self.collect_candidate_specs(&interpreters, global_specs).await;
        if !interpreters.is_empty() {
            candidates.retain(|spec| !is_default_registration(spec));
        }

        let mut unmatched = interpreters.clone();
        let mut connections = Vec::new();

        for spec in candidates {
            if cancel.is_cancelled() {
                return Err(HostError::Cancelled);
            }
            match match_interpreter(&spec, &interpreters).await {
                Some(matched) => {
                    if keeps_own_entry(&spec) {
                        // Custom registrations stay visible on their own;
                        // the interpreter keeps its default entry too.
                        connections.push(KernelConnection::Spec {
                            spec,
                            interpreter: Some(matched),
                        });
                    } else {
                        unmatched.retain(|candidate| candidate.path != matched.path);
                        let bound = bind_to_interpreter(spec, &matched);
                        connections.push(KernelConnection::PythonInterpreter {
                            spec: bound,
                            interpreter: matched,
                        });
                    }
                }
                None => {
                    connections.push(KernelConnection::Spec {
                        spec,
                        interpreter: None,
                    });
                }
            }
        }

        for interpreter in unmatched {
            connections.push(KernelConnection::PythonInterpreter {
                spec: synthetic_spec(&interpreter),
                interpreter,
            });
        }

        sort_active_first(&mut connections, active.as_ref());
        debug!("Interpreter scan produced {} kernels", connections.len());
        Ok(connections)
    }

    /// Specs under each interpreter's prefix plus global Python specs with
    /// a non-default launch module
    async fn collect_candidate_specs(
        &self,
        interpreters: &[Interpreter],
        global_specs: &[KernelConnection],
    ) -> Vec<KernelSpec> {
        let prefix_scans = interpreters
            .iter()
            .map(|interpreter| self.scan_prefix(interpreter));
        let mut candidates: Vec<KernelSpec> =
            join_all(prefix_scans).await.into_iter().flatten().collect();

        for connection in global_specs {
            let Some(spec) = connection.spec() else {
                continue;
            };
            if spec.language.eq_ignore_ascii_case(PYTHON_LANGUAGE)
                && spec
                    .launch_module()
                    .is_some_and(|module| !is_default_launch_module(module))
            {
                candidates.push(spec.clone());
            }
        }

        // The same spec file can surface through several interpreters
        // sharing a prefix; keep the first sighting.
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|spec| match &spec.spec_file {
            Some(spec_file) => seen.insert(spec_file.clone()),
            None => true,
        });
        candidates
    }

    async fn scan_prefix(&self, interpreter: &Interpreter) -> Vec<KernelSpec> {
        let root = interpreter.kernel_spec_root();
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            trace!("No kernel specs under {}", root.display());
            return Vec::new();
        };

        let mut spec_files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                spec_files.push(path.join("kernel.json"));
            }
        }

        join_all(
            spec_files
                .iter()
                .map(|spec_file| self.loader.load_spec(spec_file, None)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Match a spec to the interpreter that owns it
///
/// Rules are tried in priority order across all interpreters:
/// metadata-declared path, fully qualified `argv[0]`, the spec's
/// `interpreter_path` field, then display-name equality.
async fn match_interpreter(
    spec: &KernelSpec,
    interpreters: &[Interpreter],
) -> Option<Interpreter> {
    if let Some(declared) = spec.metadata_interpreter_path() {
        for interpreter in interpreters {
            if paths_equal(declared, &interpreter.path).await {
                return Some(interpreter.clone());
            }
        }
    }

    if let Some(executable) = spec.executable() {
        let executable = Path::new(executable);
        if executable.is_absolute() {
            for interpreter in interpreters {
                if paths_equal(executable, &interpreter.path).await {
                    return Some(interpreter.clone());
                }
            }
        }
    }

    if let Some(declared) = &spec.interpreter_path {
        for interpreter in interpreters {
            if paths_equal(declared, &interpreter.path).await {
                return Some(interpreter.clone());
            }
        }
    }

    interpreters
        .iter()
        .find(|interpreter| interpreter.display_name == spec.display_name)
        .cloned()
}

/// True when a matched spec should stay visible as its own entry instead
/// of merging into the interpreter connection: it carries custom
/// environment variables, or the user registered it with a custom launch
/// line.
fn keeps_own_entry(spec: &KernelSpec) -> bool {
    if !spec.env.is_empty() {
        return true;
    }
    !spec.is_host_registered()
        && spec
            .launch_module()
            .is_some_and(|module| !is_default_launch_module(module))
}

/// Rewrite a merged spec so its identity is the interpreter's
fn bind_to_interpreter(mut spec: KernelSpec, interpreter: &Interpreter) -> KernelSpec {
    let bookkeeping = spec
        .metadata
        .nbkernel
        .get_or_insert_with(HostBookkeeping::default);
    if bookkeeping.original_display_name.is_none() {
        bookkeeping.original_display_name = Some(spec.display_name.clone());
    }
    spec.name = spec_name_for_interpreter(&interpreter.path);
    if spec.language.eq_ignore_ascii_case(PYTHON_LANGUAGE) {
        spec.display_name.clone_from(&interpreter.display_name);
    }
    spec
}

/// Template spec launching the default kernel of `interpreter`
fn synthetic_spec(interpreter: &Interpreter) -> KernelSpec {
    KernelSpec {
        name: spec_name_for_interpreter(&interpreter.path),
        display_name: interpreter.display_name.clone(),
        language: PYTHON_LANGUAGE.to_string(),
        argv: vec![
            interpreter.path.to_string_lossy().into_owned(),
            "-m".to_string(),
            DEFAULT_LAUNCH_MODULE.to_string(),
            "-f".to_string(),
            CONNECTION_FILE_PLACEHOLDER.to_string(),
        ],
        env: std::collections::HashMap::new(),
        interrupt_mode: InterruptMode::Signal,
        metadata: SpecMetadata::default(),
        interpreter_path: Some(interpreter.path.clone()),
        spec_file: None,
    }
}

/// True for ambiguous default registrations (`python3`, `Python 3
/// (ipykernel)`, ...) that an interpreter connection replaces
fn is_default_registration(spec: &KernelSpec) -> bool {
    static DEFAULT_NAME: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = DEFAULT_NAME
        .get_or_init(|| regex::Regex::new(r"^python\s?\d?\.?\d?$").expect("valid regex"));

    if pattern.is_match(&spec.name.to_lowercase()) {
        return true;
    }
    DEFAULT_DISPLAY_NAMES.contains(&spec.display_name.as_str())
}

/// Active interpreter's connection first, then by display name
fn sort_active_first(connections: &mut [KernelConnection], active: Option<&Interpreter>) {
    connections.sort_by(|a, b| {
        let a_active = is_for_active(a, active);
        let b_active = is_for_active(b, active);
        b_active
            .cmp(&a_active)
            .then_with(|| a.display_name().cmp(b.display_name()))
    });
}

fn is_for_active(connection: &KernelConnection, active: Option<&Interpreter>) -> bool {
    match (connection.interpreter(), active) {
        (Some(interpreter), Some(active)) => interpreter.path == active.path,
        _ => false,
    }
}
