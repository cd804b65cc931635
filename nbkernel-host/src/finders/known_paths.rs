//! Discovery over the well-known kernel-spec paths
//!
//! Scans every root produced by the path resolver one level deep for
//! `kernel.json` files, independent of any interpreter. Also performs the
//! one-shot archival of registrations written by older installations of
//! this host.

use crate::config::HostConfig;
use crate::finders::PYTHON_LANGUAGE;
use crate::paths::PathResolver;
use crate::specs::{SpecLoader, ARCHIVE_DIR_NAME};
use futures::future::join_all;
use nbkernel_core::{HostError, KernelConnection, KeyValueStore, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Store key recording that archival ran for this installed version
fn archive_flag_key() -> String {
    format!("kernels.archive-performed.{}", env!("CARGO_PKG_VERSION"))
}

/// Finds kernels under the well-known kernel-spec paths
pub struct KnownPathFinder {
    resolver: Arc<PathResolver>,
    loader: Arc<SpecLoader>,
    store: Arc<dyn KeyValueStore>,
    config: Arc<HostConfig>,
    scan_cache: Mutex<Option<Vec<KernelConnection>>>,
}

impl KnownPathFinder {
    /// Create a finder over the given resolver and loader
    pub fn new(
        resolver: Arc<PathResolver>,
        loader: Arc<SpecLoader>,
        store: Arc<dyn KeyValueStore>,
        config: Arc<HostConfig>,
    ) -> Self {
        Self {
            resolver,
            loader,
            store,
            config,
            scan_cache: Mutex::new(None),
        }
    }

    /// List kernel specs found under the known paths
    ///
    /// With `include_python` false, Python specs are dropped — the
    /// interpreter finder re-emits them bound to their environments.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires during the scan.
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn list_kernel_specs(
        &self,
        include_python: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<KernelConnection>> {
        let cached = self.scan_cache.lock().clone();
        let connections = match cached {
            Some(connections) => connections,
            None => {
                let connections = self.scan(cancel).await?;
                *self.scan_cache.lock() = Some(connections.clone());
                connections
            }
        };

        if include_python {
            return Ok(connections);
        }
        Ok(connections
            .into_iter()
            .filter(|connection| {
                connection
                    .spec()
                    .map_or(true, |spec| !spec.language.eq_ignore_ascii_case(PYTHON_LANGUAGE))
            })
            .collect())
    }

    /// Drop cached scan results
    pub fn clear_cache(&self) {
        *self.scan_cache.lock() = None;
        self.loader.evict();
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<Vec<KernelConnection>> {
        let roots = self.resolver.kernel_spec_roots(cancel).await?;
        let archive = self.should_archive().await;

        let mut connections = Vec::new();
        let mut seen_names = HashSet::new();
        for root in roots {
            if cancel.is_cancelled() {
                return Err(HostError::Cancelled);
            }
            for spec in self.scan_root(&root).await {
                if archive && spec.is_host_registered() {
                    if let Some(spec_file) = &spec.spec_file {
                        self.archive_spec(spec_file).await;
                    }
                    continue;
                }
                // Earlier roots shadow later ones on spec name.
                if seen_names.insert(spec.name.clone()) {
                    connections.push(KernelConnection::Spec {
                        spec,
                        interpreter: None,
                    });
                }
            }
        }

        if archive {
            if let Err(error) = self
                .store
                .put(&archive_flag_key(), serde_json::Value::Bool(true))
                .await
            {
                warn!("Failed to persist archive flag: {error}");
            }
        }

        debug!("Known-path scan found {} kernels", connections.len());
        Ok(connections)
    }

    /// Load every `kernels/<name>/kernel.json` directly under `root`
    async fn scan_root(&self, root: &Path) -> Vec<nbkernel_core::KernelSpec> {
        let Ok(mut entries) = tokio::fs::read_dir(root).await else {
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

    /// One-shot per installed version; never under CI
    async fn should_archive(&self) -> bool {
        if self.config.ci_mode {
            return false;
        }
        match self.store.get(&archive_flag_key()).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(error) => {
                warn!("Failed to read archive flag: {error}");
                false
            }
        }
    }

    /// Move the spec's directory into the sibling archive directory
    async fn archive_spec(&self, spec_file: &Path) {
        let Some(kernel_dir) = spec_file.parent() else {
            return;
        };
        let Some(kernels_root) = kernel_dir.parent() else {
            return;
        };
        let Some(kernel_name) = kernel_dir.file_name() else {
            return;
        };

        let archive_root = kernels_root.join(ARCHIVE_DIR_NAME);
        let destination = archive_root.join(kernel_name);
        let result: std::io::Result<()> = async {
            tokio::fs::create_dir_all(&archive_root).await?;
            tokio::fs::rename(kernel_dir, &destination).await
        }
        .await;

        match result {
            Ok(()) => info!(
                "Archived stale kernel registration {} to {}",
                kernel_dir.display(),
                destination.display()
            ),
            Err(error) => warn!(
                "Failed to archive kernel registration {}: {}",
                kernel_dir.display(),
                error
            ),
        }
    }
}
