//! Preferred-kernel ranking
//!
//! Scores discovered connections against a notebook's saved metadata and
//! returns the best match. Scoring is additive; ties are broken by
//! discovery order.

use nbkernel_core::{HostError, Interpreter, KernelConnection, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::trace;

/// Saved kernel selection metadata of a notebook
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    /// The notebook's saved kernel spec reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelspec: Option<KernelSpecRef>,
    /// The notebook's language info block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_info: Option<LanguageInfo>,
    /// Hash of the interpreter the notebook last ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_hash: Option<String>,
}

/// `metadata.kernelspec` block of a notebook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecRef {
    /// Saved kernel name
    pub name: String,
    /// Saved display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// `metadata.language_info` block of a notebook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    /// Language name
    pub name: String,
}

impl NotebookMetadata {
    /// Parse metadata from a notebook's JSON `metadata` object
    ///
    /// # Errors
    ///
    /// Returns `Parse` when the user-supplied metadata does not match the
    /// expected shape.
    pub fn from_json(value: serde_json::Value, origin: &Path) -> Result<Self> {
        serde_json::from_value(value).map_err(|error| HostError::parse(origin, error.to_string()))
    }

    /// Saved language, from `language_info`
    pub fn language(&self) -> Option<&str> {
        self.language_info.as_ref().map(|info| info.name.as_str())
    }
}

/// Score weights, highest-signal first
const WEIGHT_INTERPRETER_HASH: u32 = 1000;
const WEIGHT_NAME: u32 = 500;
const WEIGHT_DISPLAY_NAME: u32 = 200;
const WEIGHT_LANGUAGE: u32 = 100;
const WEIGHT_ACTIVE_INTERPRETER: u32 = 50;
const WEIGHT_ACTIVE_LANGUAGE_DEFAULT: u32 = 25;

/// Pick the best candidate for `metadata`
///
/// Returns `None` only when `candidates` is empty. Ties keep the earliest
/// candidate, preserving discovery order.
pub fn pick_preferred<'a>(
    candidates: &'a [KernelConnection],
    metadata: &NotebookMetadata,
    active: Option<&Interpreter>,
) -> Option<&'a KernelConnection> {
    let mut best: Option<(&KernelConnection, u32)> = None;
    for candidate in candidates {
        let candidate_score = score(candidate, metadata, active);
        trace!(
            "Ranked {} at {}",
            candidate.display_name(),
            candidate_score
        );
        match best {
            Some((_, best_score)) if candidate_score <= best_score => {}
            _ => best = Some((candidate, candidate_score)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

fn score(
    candidate: &KernelConnection,
    metadata: &NotebookMetadata,
    active: Option<&Interpreter>,
) -> u32 {
    let mut total = 0;

    if let (Some(hash), Some(interpreter)) =
        (metadata.interpreter_hash.as_deref(), candidate.interpreter())
    {
        if interpreter.hash() == hash {
            total += WEIGHT_INTERPRETER_HASH;
        }
    }

    if let (Some(saved), Some(spec)) = (metadata.kernelspec.as_ref(), candidate.spec()) {
        if saved.name == spec.name {
            total += WEIGHT_NAME;
        }
        if saved.display_name.as_deref() == Some(candidate.display_name()) {
            total += WEIGHT_DISPLAY_NAME;
        }
    }

    if let (Some(language), Some(spec)) = (metadata.language(), candidate.spec()) {
        if spec.language.eq_ignore_ascii_case(language) {
            total += WEIGHT_LANGUAGE;
        }
    }

    if let (Some(active), Some(interpreter)) = (active, candidate.interpreter()) {
        if active.path == interpreter.path {
            total += WEIGHT_ACTIVE_INTERPRETER;

            // With no saved kernelspec, a notebook in the active
            // interpreter's language leans toward that interpreter's
            // default kernel.
            if metadata.kernelspec.is_none()
                && matches!(candidate, KernelConnection::PythonInterpreter { .. })
                && metadata
                    .language()
                    .is_some_and(|language| language.eq_ignore_ascii_case("python"))
            {
                total += WEIGHT_ACTIVE_LANGUAGE_DEFAULT;
            }
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbkernel_core::kernelspec::{EnvironmentType, InterruptMode, SpecMetadata};
    use nbkernel_core::KernelSpec;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn spec(name: &str, display_name: &str, language: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            display_name: display_name.to_string(),
            language: language.to_string(),
            argv: vec![language.to_string()],
            env: HashMap::new(),
            interrupt_mode: InterruptMode::Signal,
            metadata: SpecMetadata::default(),
            interpreter_path: None,
            spec_file: None,
        }
    }

    fn interpreter(path: &str) -> Interpreter {
        Interpreter {
            path: PathBuf::from(path),
            sys_prefix: PathBuf::from("/usr"),
            display_name: "Python 3".to_string(),
            version: None,
            env_type: EnvironmentType::System,
        }
    }

    fn spec_connection(name: &str, display_name: &str, language: &str) -> KernelConnection {
        KernelConnection::Spec {
            spec: spec(name, display_name, language),
            interpreter: None,
        }
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let metadata = NotebookMetadata::default();
        assert!(pick_preferred(&[], &metadata, None).is_none());
    }

    #[test]
    fn test_name_beats_display_name_and_language() {
        let candidates = vec![
            spec_connection("ir", "Python 3", "python"),
            spec_connection("python3", "Other", "julia"),
        ];
        let metadata = NotebookMetadata {
            kernelspec: Some(KernelSpecRef {
                name: "python3".to_string(),
                display_name: Some("Python 3".to_string()),
            }),
            language_info: Some(LanguageInfo {
                name: "python".to_string(),
            }),
            interpreter_hash: None,
        };
        let preferred = pick_preferred(&candidates, &metadata, None).unwrap();
        assert_eq!(preferred.spec().unwrap().name, "python3");
    }

    #[test]
    fn test_interpreter_hash_beats_everything() {
        let python = interpreter("/opt/venv/bin/python");
        let candidates = vec![
            spec_connection("python3", "Python 3", "python"),
            KernelConnection::PythonInterpreter {
                spec: spec("nbk-aaaa", "Venv", "python"),
                interpreter: python.clone(),
            },
        ];
        let metadata = NotebookMetadata {
            kernelspec: Some(KernelSpecRef {
                name: "python3".to_string(),
                display_name: None,
            }),
            language_info: None,
            interpreter_hash: Some(python.hash()),
        };
        let preferred = pick_preferred(&candidates, &metadata, None).unwrap();
        assert_eq!(preferred.display_name(), "Venv");
    }

    #[test]
    fn test_ties_keep_discovery_order() {
        let candidates = vec![
            spec_connection("a", "A", "python"),
            spec_connection("b", "B", "python"),
        ];
        let metadata = NotebookMetadata {
            kernelspec: None,
            language_info: Some(LanguageInfo {
                name: "python".to_string(),
            }),
            interpreter_hash: None,
        };
        let preferred = pick_preferred(&candidates, &metadata, None).unwrap();
        assert_eq!(preferred.display_name(), "A");
    }

    #[test]
    fn test_active_interpreter_default_without_kernelspec() {
        let active = interpreter("/usr/bin/python3");
        let candidates = vec![
            spec_connection("ir", "R", "python"),
            KernelConnection::PythonInterpreter {
                spec: spec("nbk-bbbb", "Python 3", "python"),
                interpreter: active.clone(),
            },
        ];
        let metadata = NotebookMetadata {
            kernelspec: None,
            language_info: Some(LanguageInfo {
                name: "python".to_string(),
            }),
            interpreter_hash: None,
        };
        let preferred = pick_preferred(&candidates, &metadata, Some(&active)).unwrap();
        assert_eq!(preferred.display_name(), "Python 3");
    }

    #[test]
    fn test_malformed_metadata_is_parse_error() {
        let error = NotebookMetadata::from_json(
            serde_json::json!({"kernelspec": {"display_name": 7}}),
            Path::new("nb.ipynb"),
        )
        .unwrap_err();
        assert_eq!(error.code(), "parse-error");
    }
}
