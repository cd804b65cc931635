//! Kernel-spec search roots
//!
//! Resolves the ordered list of directories scanned for kernel specs:
//! entries from `JUPYTER_PATH`, the per-user data directory, then the
//! system-wide roots. Results are cached until an observed change in the
//! contributing environment variables invalidates them.
//!
//! Search-path layout follows
//! <https://docs.jupyter.org/en/latest/use/jupyter-directories.html#data-files>.

use nbkernel_core::{HostError, Result};
use parking_lot::Mutex;
use std::env;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Resolves and caches the kernel-spec search roots
pub struct PathResolver {
    cached: Mutex<Option<CachedRoots>>,
    override_roots: Option<Vec<PathBuf>>,
}

#[derive(Clone)]
struct CachedRoots {
    snapshot: EnvSnapshot,
    roots: Vec<PathBuf>,
}

/// Environment variables whose changes invalidate the cache
#[derive(Clone, PartialEq, Eq)]
struct EnvSnapshot {
    jupyter_path: Option<String>,
    all_users_profile: Option<String>,
}

impl EnvSnapshot {
    fn capture() -> Self {
        Self {
            jupyter_path: env::var("JUPYTER_PATH").ok(),
            all_users_profile: env::var("ALLUSERSPROFILE").ok(),
        }
    }
}

impl PathResolver {
    /// Create a resolver with an empty cache
    pub const fn new() -> Self {
        Self {
            cached: Mutex::new(None),
            override_roots: None,
        }
    }

    /// Create a resolver that only ever yields `roots`
    ///
    /// Used by embedders and tests that control the search space
    /// explicitly.
    pub const fn with_static_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            cached: Mutex::new(None),
            override_roots: Some(roots),
        }
    }

    /// Ordered kernel-spec search roots, canonicalized and deduplicated
    ///
    /// Earlier roots win when downstream consumers dedupe by spec name.
    /// Paths that cannot be canonicalized (typically: do not exist) are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires during resolution.
    pub async fn kernel_spec_roots(&self, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let snapshot = EnvSnapshot::capture();
        {
            let cached = self.cached.lock();
            if let Some(entry) = cached.as_ref() {
                if entry.snapshot == snapshot {
                    trace!("Kernel spec roots served from cache");
                    return Ok(entry.roots.clone());
                }
            }
        }

        let candidates = match &self.override_roots {
            Some(overridden) => overridden.clone(),
            None => candidate_roots(&snapshot),
        };

        let mut roots = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(HostError::Cancelled);
            }
            match tokio::fs::canonicalize(&candidate).await {
                Ok(resolved) => {
                    if !roots.contains(&resolved) {
                        roots.push(resolved);
                    }
                }
                Err(error) => {
                    trace!(
                        "Dropping unresolvable kernel spec root {}: {}",
                        candidate.display(),
                        error
                    );
                }
            }
        }

        debug!("Resolved {} kernel spec roots", roots.len());
        *self.cached.lock() = Some(CachedRoots {
            snapshot,
            roots: roots.clone(),
        });
        Ok(roots)
    }

    /// Drop the cached roots, forcing re-resolution on the next call
    pub fn clear_cache(&self) {
        *self.cached.lock() = None;
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Candidate roots in priority order, before canonicalization
fn candidate_roots(snapshot: &EnvSnapshot) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(jupyter_path) = &snapshot.jupyter_path {
        let separator = if cfg!(windows) { ';' } else { ':' };
        for entry in jupyter_path.split(separator).filter(|entry| !entry.is_empty()) {
            candidates.push(PathBuf::from(entry).join("kernels"));
        }
    }

    if let Some(user_root) = user_kernel_root() {
        candidates.push(user_root);
    }

    if cfg!(windows) {
        if let Some(profile) = &snapshot.all_users_profile {
            candidates.push(PathBuf::from(profile).join("jupyter").join("kernels"));
        }
    } else {
        candidates.push(PathBuf::from("/usr/share/jupyter/kernels"));
        candidates.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
    }

    candidates
}

/// Per-user kernel-spec directory for the current OS
fn user_kernel_root() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let root = if cfg!(windows) {
        home.join("AppData").join("Roaming").join("jupyter")
    } else if cfg!(target_os = "macos") {
        home.join("Library").join("Jupyter")
    } else {
        home.join(".local").join("share").join("jupyter")
    };
    Some(root.join("kernels"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state; keep them in one
    // test so they cannot race each other.
    #[tokio::test]
    async fn test_jupyter_path_entries_come_first_and_cache_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        tokio::fs::create_dir_all(first.join("kernels")).await.unwrap();
        tokio::fs::create_dir_all(second.join("kernels")).await.unwrap();

        let resolver = PathResolver::new();
        let cancel = CancellationToken::new();

        env::set_var(
            "JUPYTER_PATH",
            format!("{}:{}", first.display(), second.display()),
        );
        let roots = resolver.kernel_spec_roots(&cancel).await.unwrap();
        let first_resolved = tokio::fs::canonicalize(first.join("kernels")).await.unwrap();
        let second_resolved = tokio::fs::canonicalize(second.join("kernels")).await.unwrap();
        assert_eq!(roots[0], first_resolved);
        assert_eq!(roots[1], second_resolved);

        // A changed JUPYTER_PATH invalidates the cached roots
        env::set_var("JUPYTER_PATH", second.display().to_string());
        let roots = resolver.kernel_spec_roots(&cancel).await.unwrap();
        assert_eq!(roots[0], second_resolved);
        assert!(!roots.contains(&first_resolved));

        env::remove_var("JUPYTER_PATH");
    }

    #[tokio::test]
    async fn test_nonexistent_roots_are_dropped() {
        let resolver = PathResolver::new();
        let cancel = CancellationToken::new();
        let roots = resolver.kernel_spec_roots(&cancel).await.unwrap();
        for root in &roots {
            assert!(root.exists(), "{} should exist", root.display());
        }
    }

    #[tokio::test]
    async fn test_cancellation() {
        let resolver = PathResolver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = resolver.kernel_spec_roots(&cancel).await.unwrap_err();
        assert_eq!(error.code(), "cancelled");
    }
}
