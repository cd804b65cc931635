//! Error taxonomy shared by every host component
//!
//! Every variant carries a stable machine-readable code so calling layers
//! can classify failures without matching on display strings.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Error type for kernel discovery, launch, and session operations
#[derive(Debug, Error)]
pub enum HostError {
    /// Selected kernel cannot be validated on disk
    #[error("Kernel is no longer valid: {reason}")]
    InvalidKernel {
        /// Why validation failed (missing spec file, missing interpreter, ...)
        reason: String,
    },

    /// Kernel process did not become ready within the launch timeout
    #[error("Kernel did not become ready within {timeout:?}")]
    LaunchTimeout {
        /// The budget that elapsed
        timeout: Duration,
    },

    /// Kernel child process exited unexpectedly
    #[error("Kernel process died (exit code {exit_code:?})")]
    KernelDied {
        /// Exit code when the OS reported one
        exit_code: Option<i32>,
        /// Tail of the process's standard error, when captured
        reason: Option<String>,
    },

    /// A package required to launch the kernel is missing from the
    /// interpreter environment
    #[error("Required package not installed: {required_package}")]
    InterpreterNotInstalled {
        /// Name of the missing launcher dependency
        required_package: String,
    },

    /// Interrupt request not acknowledged in time
    #[error("Interrupt not acknowledged within {timeout:?}")]
    InterruptTimeout {
        /// The interrupt budget that elapsed
        timeout: Duration,
    },

    /// Neither signal delivery nor message-mode interrupt is available
    #[error("Kernel does not support interrupts")]
    InterruptNotSupported,

    /// Operation on a session that already reached `Dead`
    #[error("Session has been disposed")]
    SessionDisposed,

    /// Operation aborted by the caller's cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Malformed kernel spec, connection file, or notebook metadata
    #[error("Failed to parse {}: {message}", path.display())]
    Parse {
        /// Path of the offending document
        path: PathBuf,
        /// Parser diagnostic
        message: String,
    },

    /// Host key-value store failure
    #[error("Store error: {message}")]
    Store {
        /// Backend diagnostic
        message: String,
    },

    /// Wire-level transport failure
    #[error("Transport error: {message}")]
    Transport {
        /// Transport diagnostic
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Stable code for telemetry classification in calling layers
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidKernel { .. } => "invalid-kernel",
            Self::LaunchTimeout { .. } => "launch-timeout",
            Self::KernelDied { .. } => "kernel-died",
            Self::InterpreterNotInstalled { .. } => "interpreter-not-installed",
            Self::InterruptTimeout { .. } => "interrupt-timeout",
            Self::InterruptNotSupported => "interrupt-not-supported",
            Self::SessionDisposed => "session-disposed",
            Self::Cancelled => "cancelled",
            Self::Parse { .. } => "parse-error",
            Self::Store { .. } => "store-error",
            Self::Transport { .. } => "transport-error",
            Self::Io(_) => "io-error",
        }
    }

    /// Create a parse error for a document at `path`
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// True when the error is terminal for the owning session
    pub const fn is_fatal_for_session(&self) -> bool {
        matches!(self, Self::KernelDied { .. } | Self::SessionDisposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            HostError::LaunchTimeout {
                timeout: Duration::from_secs(1)
            }
            .code(),
            "launch-timeout"
        );
        assert_eq!(
            HostError::KernelDied {
                exit_code: Some(1),
                reason: None
            }
            .code(),
            "kernel-died"
        );
        assert_eq!(HostError::SessionDisposed.code(), "session-disposed");
        assert_eq!(HostError::Cancelled.code(), "cancelled");
        assert_eq!(
            HostError::parse("/tmp/kernel.json", "bad json").code(),
            "parse-error"
        );
    }

    #[test]
    fn test_display_output() {
        let error = HostError::InterpreterNotInstalled {
            required_package: "ipykernel".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Required package not installed: ipykernel"
        );

        let error = HostError::parse("/a/kernel.json", "expected value");
        assert_eq!(error.to_string(), "Failed to parse /a/kernel.json: expected value");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HostError>();
    }
}
