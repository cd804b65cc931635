//! Tracing initialization
//!
//! Tracing calls are always present in the code and conditionally enabled
//! through the `RUST_LOG` environment variable. Embedders that bring their
//! own subscriber skip this module entirely; the CLI (and one-off tools)
//! call [`init_logging`] once at startup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for emitted log lines
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-oriented single-line text
    #[default]
    Text,
    /// One JSON object per line, for log shippers
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    /// Include span enter/exit events
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            default_directive: "warn,nbkernel_host=info,nbkernel_core=info".to_string(),
            span_events: false,
        }
    }
}

/// Install the global tracing subscriber
///
/// Idempotent: a second call (tests, embedders racing the CLI) is a no-op
/// rather than a panic.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let span_events = if config.span_events {
        tracing_subscriber::fmt::format::FmtSpan::NEW
            | tracing_subscriber::fmt::format::FmtSpan::CLOSE
    } else {
        tracing_subscriber::fmt::format::FmtSpan::NONE
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed; keeping it");
    }
}
