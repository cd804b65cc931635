//! Kernel spec and interpreter descriptors
//!
//! A `KernelSpec` is the on-disk `kernel.json` descriptor telling the host
//! how to launch a kernel. An `Interpreter` describes a language
//! environment (a Python binary and its prefix) supplied by the external
//! interpreter enumeration service.
//!
//! See <https://jupyter-client.readthedocs.io/en/latest/kernels.html#kernel-specs>
//! for the kernel spec format.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Descriptor for launching one kernel, parsed from `kernel.json`
///
/// `name` is not part of the file format; it is derived from the spec's
/// parent directory (or rewritten by the loader when the spec is bound to a
/// specific interpreter) and round-trips through the persisted cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Identifier, unique within its discovery location
    #[serde(default)]
    pub name: String,

    /// Human-readable name shown in kernel pickers
    ///
    /// Technically required by the format, but real spec files omit it
    /// often enough that the loader defaults it from the spec directory.
    #[serde(default)]
    pub display_name: String,

    /// Language the kernel executes
    pub language: String,

    /// Launch arguments; may contain the `{connection_file}` placeholder
    pub argv: Vec<String>,

    /// Environment variables merged over the host environment at launch
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// How the kernel expects to be interrupted
    #[serde(default)]
    pub interrupt_mode: InterruptMode,

    /// Optional metadata carried by registrations and host bookkeeping
    #[serde(default, skip_serializing_if = "SpecMetadata::is_empty")]
    pub metadata: SpecMetadata,

    /// Interpreter executable declared directly on the spec, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_path: Option<PathBuf>,

    /// Path the spec was loaded from; `None` for synthetic specs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_file: Option<PathBuf>,
}

impl KernelSpec {
    /// First launch argument, the kernel executable
    pub fn executable(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Module passed via `-m <module>` in `argv`, when the kernel is
    /// launched through a language launcher module
    pub fn launch_module(&self) -> Option<&str> {
        let position = self.argv.iter().position(|arg| arg == "-m")?;
        self.argv.get(position + 1).map(String::as_str)
    }

    /// Path of the interpreter hinted by the spec's metadata
    pub fn metadata_interpreter_path(&self) -> Option<&Path> {
        self.metadata
            .interpreter
            .as_ref()
            .map(|hint| hint.path.as_path())
    }

    /// True when this host wrote the registration (as opposed to a
    /// user-created or externally installed spec)
    pub fn is_host_registered(&self) -> bool {
        self.metadata
            .nbkernel
            .as_ref()
            .is_some_and(|bookkeeping| bookkeeping.registration_info.is_some())
    }
}

/// How a kernel expects interrupt requests to be delivered
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Interrupts are delivered as a SIGINT-equivalent signal
    #[default]
    Signal,
    /// Interrupts are delivered as an `interrupt_request` wire message
    Message,
}

/// Optional `metadata` block of a kernel spec
///
/// Host-written bookkeeping lives under the `nbkernel` key; everything else
/// is preserved opaquely so re-serialized specs round-trip.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecMetadata {
    /// Interpreter hint written by environment-aware installers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterHint>,

    /// Identifier of a plugin that owns this registration, when not ours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,

    /// Bookkeeping written by this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbkernel: Option<HostBookkeeping>,

    /// Unrecognized metadata, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SpecMetadata {
    /// True when no field carries data
    pub fn is_empty(&self) -> bool {
        self.interpreter.is_none()
            && self.plugin_id.is_none()
            && self.nbkernel.is_none()
            && self.extra.is_empty()
    }
}

/// Interpreter declared in spec metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterHint {
    /// Interpreter executable path
    pub path: PathBuf,
    /// Remaining hint fields, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Bookkeeping this host writes under `metadata.nbkernel`
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBookkeeping {
    /// Source path of the spec as first loaded (used for duplicate
    /// suppression of conda-style double registrations)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_spec_file: Option<PathBuf>,

    /// Display name before any interpreter-bound rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_display_name: Option<String>,

    /// Present when this host registered the spec itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_info: Option<RegistrationInfo>,
}

/// Marker identifying a spec registered by this host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Host identifier that performed the registration
    pub registered_by: String,
    /// Hash of the interpreter the registration was made for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_hash: Option<String>,
}

/// A language-environment executable that can host a kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpreter {
    /// Executable path
    pub path: PathBuf,
    /// Environment prefix (`sys.prefix` for Python)
    pub sys_prefix: PathBuf,
    /// Human-readable environment name
    pub display_name: String,
    /// Interpreter version, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<InterpreterVersion>,
    /// Kind of environment the interpreter belongs to
    #[serde(default)]
    pub env_type: EnvironmentType,
}

impl Interpreter {
    /// Stable hash of the interpreter's executable path
    ///
    /// This is the "interpreter hash" notebook metadata and the preferred-
    /// kernel cache key off of.
    pub fn hash(&self) -> String {
        interpreter_hash(&self.path)
    }

    /// Kernel-spec directory under this interpreter's prefix
    pub fn kernel_spec_root(&self) -> PathBuf {
        self.sys_prefix.join("share").join("jupyter").join("kernels")
    }
}

/// Kind of environment an interpreter belongs to
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    /// Globally installed interpreter
    System,
    /// `venv`/`virtualenv` environment
    #[serde(rename = "virtualenv")]
    VirtualEnv,
    /// Conda environment
    Conda,
    /// Could not be determined
    #[default]
    Unknown,
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::VirtualEnv => write!(f, "virtualenv"),
            Self::Conda => write!(f, "conda"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Interpreter version triple
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compute the stable hash of an interpreter executable path
///
/// Paths are compared case-insensitively on Windows, so the hash input is
/// lowercased there before digesting.
pub fn interpreter_hash(path: &Path) -> String {
    let text = path.to_string_lossy();
    let normalized = if cfg!(windows) {
        text.to_lowercase()
    } else {
        text.into_owned()
    };
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Stable spec name for a spec bound to an interpreter
///
/// Two interpreters must never alias on spec name, so the name is derived
/// from the interpreter path hash rather than the spec directory.
pub fn spec_name_for_interpreter(path: &Path) -> String {
    format!("nbk-{}", &interpreter_hash(path)[..12])
}
