//! Kernel connection descriptors
//!
//! A `KernelConnection` is the unit discovery produces and selection ranks:
//! everything needed to start (or attach to) one kernel. Local variants
//! carry the spec and, when matched, the interpreter supplying its
//! environment; the `Live` variant exists for interface parity with remote
//! finders and diverges in lifecycle.

use crate::kernelspec::{Interpreter, KernelSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity of a kernel connection
///
/// Derived from the spec identity and the interpreter path, so the same
/// kernel discovered twice collapses to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Model of a running kernel on a remote server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveKernelModel {
    /// Server-assigned kernel id
    pub id: String,
    /// Kernel spec name on the server
    pub name: String,
    /// Display name, when the server reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One way of obtaining a kernel, as produced by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelConnection {
    /// Launch a discovered kernel spec as a local child process
    Spec {
        /// The spec to launch
        spec: KernelSpec,
        /// Interpreter matched to the spec, when one was found
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpreter: Option<Interpreter>,
    },

    /// Launch the default kernel of a Python environment
    PythonInterpreter {
        /// Synthetic spec built for the interpreter
        spec: KernelSpec,
        /// The interpreter supplying executable and environment
        interpreter: Interpreter,
    },

    /// Attach to a kernel already running on a remote server
    Live {
        /// The remote kernel's model
        model: LiveKernelModel,
        /// Base URL of the owning server
        base_url: String,
    },
}

impl KernelConnection {
    /// Stable id over (spec identity, interpreter path)
    pub fn id(&self) -> ConnectionId {
        let mut hasher = Sha256::new();
        match self {
            Self::Spec { spec, interpreter } => {
                hasher.update(b"spec");
                hash_spec_identity(&mut hasher, spec);
                if let Some(interpreter) = interpreter {
                    hasher.update(interpreter.path.to_string_lossy().as_bytes());
                }
            }
            Self::PythonInterpreter { spec, interpreter } => {
                hasher.update(b"interpreter");
                hash_spec_identity(&mut hasher, spec);
                hasher.update(interpreter.path.to_string_lossy().as_bytes());
            }
            Self::Live { model, base_url } => {
                hasher.update(b"live");
                hasher.update(base_url.as_bytes());
                hasher.update(model.id.as_bytes());
            }
        }
        ConnectionId(hex::encode(&hasher.finalize()[..16]))
    }

    /// The kernel spec, for variants that carry one
    pub const fn spec(&self) -> Option<&KernelSpec> {
        match self {
            Self::Spec { spec, .. } | Self::PythonInterpreter { spec, .. } => Some(spec),
            Self::Live { .. } => None,
        }
    }

    /// The matched interpreter, when one is attached
    pub const fn interpreter(&self) -> Option<&Interpreter> {
        match self {
            Self::Spec { interpreter, .. } => interpreter.as_ref(),
            Self::PythonInterpreter { interpreter, .. } => Some(interpreter),
            Self::Live { .. } => None,
        }
    }

    /// Display name to show in pickers
    pub fn display_name(&self) -> &str {
        match self {
            Self::Spec { spec, .. } | Self::PythonInterpreter { spec, .. } => &spec.display_name,
            Self::Live { model, .. } => {
                model.display_name.as_deref().unwrap_or(model.name.as_str())
            }
        }
    }

    /// True for connections backed by a local child process
    pub const fn is_local(&self) -> bool {
        !matches!(self, Self::Live { .. })
    }
}

fn hash_spec_identity(hasher: &mut Sha256, spec: &KernelSpec) {
    hasher.update(spec.name.as_bytes());
    if let Some(spec_file) = &spec.spec_file {
        hasher.update(spec_file.to_string_lossy().as_bytes());
    } else {
        // Synthetic specs have no file; their identity is the launch line.
        for arg in &spec.argv {
            hasher.update(arg.as_bytes());
        }
    }
}
