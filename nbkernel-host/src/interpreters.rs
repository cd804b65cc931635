//! Interpreter enumeration implementations
//!
//! The enumeration seam is `nbkernel_core::InterpreterService`. This module
//! provides a best-effort built-in implementation that walks `PATH`, and a
//! static implementation for tests and embedders that already know their
//! environments.

use async_trait::async_trait;
use nbkernel_core::kernelspec::{EnvironmentType, Interpreter, InterpreterVersion};
use nbkernel_core::InterpreterService;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

/// Built-in interpreter enumeration over `PATH`
///
/// Finds `python3`/`python` executables, derives each environment's prefix
/// and kind, and caches the result for the process lifetime.
pub struct SystemInterpreterService {
    cached: OnceCell<Vec<Interpreter>>,
}

impl SystemInterpreterService {
    /// Create a service with an empty cache
    pub const fn new() -> Self {
        Self {
            cached: OnceCell::const_new(),
        }
    }

    async fn enumerate() -> Vec<Interpreter> {
        let mut interpreters = Vec::new();
        for name in ["python3", "python"] {
            let Ok(found) = which::which_all(name) else {
                continue;
            };
            let found: Vec<PathBuf> = found.collect();
            for path in found {
                let resolved = tokio::fs::canonicalize(&path)
                    .await
                    .unwrap_or_else(|_| path.clone());
                if interpreters
                    .iter()
                    .any(|known: &Interpreter| known.path == resolved)
                {
                    continue;
                }
                if let Some(interpreter) = probe_interpreter(&resolved).await {
                    interpreters.push(interpreter);
                }
            }
        }
        debug!("Enumerated {} interpreters from PATH", interpreters.len());
        interpreters
    }
}

impl Default for SystemInterpreterService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterpreterService for SystemInterpreterService {
    async fn list_interpreters(&self) -> Vec<Interpreter> {
        self.cached.get_or_init(Self::enumerate).await.clone()
    }

    async fn active_interpreter(&self, resource: Option<&Path>) -> Option<Interpreter> {
        // A workspace-local .venv takes precedence over anything on PATH.
        if let Some(resource) = resource {
            let venv_python = resource.join(".venv").join("bin").join("python");
            if tokio::fs::try_exists(&venv_python).await.unwrap_or(false) {
                if let Some(interpreter) = probe_interpreter(&venv_python).await {
                    return Some(interpreter);
                }
            }
        }
        self.list_interpreters().await.into_iter().next()
    }

    async fn activation_env(&self, interpreter: &Interpreter) -> HashMap<String, String> {
        activation_env_for(interpreter)
    }
}

/// Build an `Interpreter` descriptor for an executable on disk
async fn probe_interpreter(path: &Path) -> Option<Interpreter> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return None;
    }

    // bin/python -> prefix (share/... lives alongside bin/)
    let sys_prefix = path.parent()?.parent()?.to_path_buf();
    let env_type = classify_environment(&sys_prefix).await;
    let version = version_from_file_name(path);

    let environment_name = sys_prefix
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| sys_prefix.display().to_string());
    let display_name = match (&version, env_type) {
        (Some(version), EnvironmentType::System) => format!("Python {version}"),
        (Some(version), _) => format!("Python {version} ({environment_name})"),
        (None, EnvironmentType::System) => "Python".to_string(),
        (None, _) => format!("Python ({environment_name})"),
    };

    trace!(
        "Probed interpreter {} ({} at {})",
        path.display(),
        env_type,
        sys_prefix.display()
    );
    Some(Interpreter {
        path: path.to_path_buf(),
        sys_prefix,
        display_name,
        version,
        env_type,
    })
}

async fn classify_environment(sys_prefix: &Path) -> EnvironmentType {
    if tokio::fs::try_exists(sys_prefix.join("pyvenv.cfg"))
        .await
        .unwrap_or(false)
    {
        return EnvironmentType::VirtualEnv;
    }
    if tokio::fs::try_exists(sys_prefix.join("conda-meta"))
        .await
        .unwrap_or(false)
    {
        return EnvironmentType::Conda;
    }
    if sys_prefix.starts_with("/usr") {
        return EnvironmentType::System;
    }
    EnvironmentType::Unknown
}

/// Parse `pythonX.Y` executable names into a version triple
fn version_from_file_name(path: &Path) -> Option<InterpreterVersion> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix("python")?;
    let mut parts = suffix.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().and_then(|minor| minor.parse().ok())?;
    Some(InterpreterVersion {
        major,
        minor,
        patch: 0,
    })
}

/// Environment variables equivalent to activating the interpreter's
/// environment
fn activation_env_for(interpreter: &Interpreter) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let prefix = interpreter.sys_prefix.display().to_string();
    match interpreter.env_type {
        EnvironmentType::VirtualEnv => {
            env.insert("VIRTUAL_ENV".to_string(), prefix);
        }
        EnvironmentType::Conda => {
            env.insert("CONDA_PREFIX".to_string(), prefix);
            if let Some(name) = interpreter.sys_prefix.file_name() {
                env.insert(
                    "CONDA_DEFAULT_ENV".to_string(),
                    name.to_string_lossy().into_owned(),
                );
            }
        }
        EnvironmentType::System | EnvironmentType::Unknown => {}
    }
    env
}

/// Interpreter service over a fixed set of environments
pub struct StaticInterpreterService {
    interpreters: Vec<Interpreter>,
    active: Option<Interpreter>,
}

impl StaticInterpreterService {
    /// Create a service answering with exactly these interpreters
    pub const fn new(interpreters: Vec<Interpreter>, active: Option<Interpreter>) -> Self {
        Self {
            interpreters,
            active,
        }
    }
}

#[async_trait]
impl InterpreterService for StaticInterpreterService {
    async fn list_interpreters(&self) -> Vec<Interpreter> {
        self.interpreters.clone()
    }

    async fn active_interpreter(&self, _resource: Option<&Path>) -> Option<Interpreter> {
        self.active.clone()
    }

    async fn activation_env(&self, interpreter: &Interpreter) -> HashMap<String, String> {
        activation_env_for(interpreter)
    }
}
