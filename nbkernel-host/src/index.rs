//! Local kernel index
//!
//! The union of the known-path and interpreter finders, fronted by a
//! persistent cache with staleness validation, plus preferred-kernel
//! selection for notebooks. The index owns every cache involved so tests
//! construct their own instances; nothing here is global.

use crate::finders::{InterpreterKernelFinder, KnownPathFinder};
use crate::paths::PathResolver;
use crate::ranking::{pick_preferred, NotebookMetadata};
use crate::specs::SpecLoader;
use crate::Services;
use dashmap::DashMap;
use metrics::counter;
use nbkernel_core::{
    ConnectionId, HostError, InterpreterService, KernelConnection, KeyValueStore, Result,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Store key holding the last-known kernel connection list
pub const KERNEL_LIST_CACHE_KEY: &str = "kernels.connection-list";

/// Store key holding the interpreter-hash → preferred-connection map
pub const PREFERRED_KERNELS_CACHE_KEY: &str = "kernels.preferred-by-interpreter";

/// Plugin owners that manage their own kernels; their registrations are
/// filtered out of discovery results
pub const FOREIGN_PLUGIN_OWNERS: &[&str] = &["azureml.kernels", "databricks.kernels"];

/// Whether a listing may be served from the cached connection list
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheUsage {
    /// Race the validated cache against a fresh scan
    UseCache,
    /// Always run a fresh scan
    IgnoreCache,
}

/// Discovery, caching, and selection over local kernels
pub struct LocalKernelIndex {
    known_paths: Arc<KnownPathFinder>,
    interpreter_kernels: Arc<InterpreterKernelFinder>,
    interpreter_service: Arc<dyn InterpreterService>,
    store: Arc<dyn KeyValueStore>,
    /// In-memory copy of the last persisted list; copy-on-read
    last_known: Mutex<Vec<KernelConnection>>,
    /// Per-workspace preferred-kernel memo; each entry resolves once
    workspace_preferences: DashMap<PathBuf, Arc<OnceCell<Option<KernelConnection>>>>,
}

impl LocalKernelIndex {
    /// Compose an index from the host services
    pub fn new(services: &Services) -> Arc<Self> {
        let resolver = Arc::new(PathResolver::new());
        Self::with_finders(services, resolver)
    }

    /// Compose an index with an explicit path resolver (tests, embedders)
    pub fn with_finders(services: &Services, resolver: Arc<PathResolver>) -> Arc<Self> {
        let loader = Arc::new(SpecLoader::new());
        let known_paths = Arc::new(KnownPathFinder::new(
            resolver,
            Arc::clone(&loader),
            Arc::clone(&services.store),
            Arc::clone(&services.config),
        ));
        let interpreter_kernels = Arc::new(InterpreterKernelFinder::new(
            Arc::clone(&services.interpreters),
            loader,
        ));
        Arc::new(Self {
            known_paths,
            interpreter_kernels,
            interpreter_service: Arc::clone(&services.interpreters),
            store: Arc::clone(&services.store),
            last_known: Mutex::new(Vec::new()),
            workspace_preferences: DashMap::new(),
        })
    }

    /// List all kernels available for `resource`
    ///
    /// With `UseCache`, a validated copy of the last-known list races the
    /// fresh scan; whichever produces a usable answer first wins. The scan
    /// keeps running either way so the persisted cache stays fresh.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires before an answer exists.
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn list_kernels(
        self: &Arc<Self>,
        resource: Option<&Path>,
        usage: CacheUsage,
        cancel: &CancellationToken,
    ) -> Result<Vec<KernelConnection>> {
        let mut scan = self.spawn_scan(resource.map(Path::to_path_buf), cancel.clone());
        if usage == CacheUsage::IgnoreCache {
            return join_scan(scan).await;
        }

        let validate = self.validated_cache();
        tokio::pin!(validate);
        let cached = tokio::select! {
            cached = &mut validate => cached,
            fresh = &mut scan => {
                return fresh.map_err(|error| {
                    HostError::Io(std::io::Error::other(format!("discovery task failed: {error}")))
                })?;
            }
        };

        match cached {
            Some(connections) => {
                debug!("Serving {} kernels from validated cache", connections.len());
                // The dropped handle detaches; the scan finishes in the
                // background and re-persists the cache.
                Ok(connections)
            }
            None => join_scan(scan).await,
        }
    }

    /// Find the preferred kernel for a notebook
    ///
    /// The per-connection cache keyed by interpreter hash is consulted
    /// first; a hit whose interpreter still exists on disk short-circuits
    /// discovery entirely.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when `cancel` fires during discovery.
    #[instrument(level = "debug", skip(self, metadata, cancel))]
    pub async fn find_kernel(
        self: &Arc<Self>,
        resource: Option<&Path>,
        metadata: &NotebookMetadata,
        cancel: &CancellationToken,
    ) -> Result<Option<KernelConnection>> {
        if let Some(hash) = metadata.interpreter_hash.as_deref() {
            if let Some(connection) = self.preferred_from_cache(hash).await {
                counter!("kernel_find", "result" => "found").increment(1);
                return Ok(Some(connection));
            }
        }

        let result = match resource {
            Some(resource) => {
                let cell = self
                    .workspace_preferences
                    .entry(resource.to_path_buf())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone();
                cell.get_or_try_init(|| self.rank_from_list(Some(resource), metadata, cancel))
                    .await
                    .map(Clone::clone)
            }
            None => self.rank_from_list(None, metadata, cancel).await,
        };

        match &result {
            Ok(Some(_)) => counter!("kernel_find", "result" => "found").increment(1),
            Ok(None) => counter!("kernel_find", "result" => "notfound").increment(1),
            Err(_) => counter!("kernel_find", "result" => "failed").increment(1),
        }
        result
    }

    /// Forget the memoized preferred kernel for a workspace
    pub fn forget_resource(&self, resource: &Path) {
        self.workspace_preferences.remove(resource);
    }

    /// Drop every in-memory cache (store-backed state stays)
    pub fn clear_caches(&self) {
        self.last_known.lock().clear();
        self.workspace_preferences.clear();
        self.known_paths.clear_cache();
    }

    async fn rank_from_list(
        self: &Arc<Self>,
        resource: Option<&Path>,
        metadata: &NotebookMetadata,
        cancel: &CancellationToken,
    ) -> Result<Option<KernelConnection>> {
        let candidates = self
            .list_kernels(resource, CacheUsage::UseCache, cancel)
            .await?;
        let active = self.interpreter_service.active_interpreter(resource).await;
        let preferred = pick_preferred(&candidates, metadata, active.as_ref()).cloned();

        if let Some(connection) = &preferred {
            if let Some(interpreter) = connection.interpreter() {
                self.remember_preferred(&interpreter.hash(), connection).await;
            }
        }
        Ok(preferred)
    }

    /// Spawn the full scan as a detached-capable task
    fn spawn_scan(
        self: &Arc<Self>,
        resource: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<Vec<KernelConnection>>> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            // Python specs are dropped from the known-path results only
            // when the interpreter finder is in a position to re-emit
            // them bound to their environments.
            let include_python = index
                .interpreter_service
                .list_interpreters()
                .await
                .is_empty();

            let (known, interpreter_connections) = tokio::try_join!(
                index.known_paths.list_kernel_specs(include_python, &cancel),
                async {
                    let globals = index.known_paths.list_kernel_specs(true, &cancel).await?;
                    index
                        .interpreter_kernels
                        .list_kernels(&globals, resource.as_deref(), &cancel)
                        .await
                }
            )?;

            let mut connections = known;
            connections.extend(interpreter_connections);
            let connections = apply_filters(connections);

            *index.last_known.lock() = connections.clone();
            match serde_json::to_value(&connections) {
                Ok(value) => {
                    if let Err(error) = index.store.put(KERNEL_LIST_CACHE_KEY, value).await {
                        warn!("Failed to persist kernel list cache: {error}");
                    }
                }
                Err(error) => warn!("Failed to serialize kernel list cache: {error}"),
            }

            debug!("Fresh scan produced {} kernels", connections.len());
            Ok(connections)
        })
    }

    /// The last-known list with stale entries removed; `None` when nothing
    /// usable remains
    async fn validated_cache(&self) -> Option<Vec<KernelConnection>> {
        let mut cached = self.last_known.lock().clone();
        if cached.is_empty() {
            let value = self.store.get(KERNEL_LIST_CACHE_KEY).await.ok()??;
            cached = serde_json::from_value(value).ok()?;
        }

        let mut valid = Vec::new();
        for connection in cached {
            if connection_is_valid(&connection).await {
                valid.push(connection);
            }
        }
        if valid.is_empty() {
            None
        } else {
            Some(valid)
        }
    }

    async fn preferred_from_cache(&self, interpreter_hash: &str) -> Option<KernelConnection> {
        let map = self.store.get(PREFERRED_KERNELS_CACHE_KEY).await.ok()??;
        let connection: KernelConnection =
            serde_json::from_value(map.get(interpreter_hash)?.clone()).ok()?;
        let interpreter = connection.interpreter()?;
        if !tokio::fs::try_exists(&interpreter.path).await.unwrap_or(false) {
            return None;
        }
        Some(connection)
    }

    /// Record `connection` as preferred for `interpreter_hash`
    ///
    /// Read-modify-write; concurrent writers race with last-write-wins,
    /// which the store contract allows.
    pub async fn remember_preferred(&self, interpreter_hash: &str, connection: &KernelConnection) {
        let mut map = match self.store.get(PREFERRED_KERNELS_CACHE_KEY).await {
            Ok(Some(serde_json::Value::Object(map))) => map,
            _ => serde_json::Map::new(),
        };
        match serde_json::to_value(connection) {
            Ok(value) => {
                map.insert(interpreter_hash.to_string(), value);
                if let Err(error) = self
                    .store
                    .put(PREFERRED_KERNELS_CACHE_KEY, serde_json::Value::Object(map))
                    .await
                {
                    warn!("Failed to persist preferred kernel: {error}");
                }
            }
            Err(error) => warn!("Failed to serialize preferred kernel: {error}"),
        }
    }
}

async fn join_scan(scan: JoinHandle<Result<Vec<KernelConnection>>>) -> Result<Vec<KernelConnection>> {
    scan.await.map_err(|error| {
        HostError::Io(std::io::Error::other(format!("discovery task failed: {error}")))
    })?
}

/// A cache entry is valid while its spec file and interpreter still exist
async fn connection_is_valid(connection: &KernelConnection) -> bool {
    if let Some(spec) = connection.spec() {
        if let Some(spec_file) = &spec.spec_file {
            if !tokio::fs::try_exists(spec_file).await.unwrap_or(false) {
                return false;
            }
        }
    }
    if let Some(interpreter) = connection.interpreter() {
        if !tokio::fs::try_exists(&interpreter.path).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Final filtering over the unioned finder results
fn apply_filters(connections: Vec<KernelConnection>) -> Vec<KernelConnection> {
    let mut connections: Vec<KernelConnection> = connections
        .into_iter()
        .filter(|connection| {
            let Some(spec) = connection.spec() else {
                return true;
            };
            // Legacy wasm variant kernels are never launchable here.
            if spec
                .executable()
                .is_some_and(|executable| executable.ends_with("xpython"))
            {
                return false;
            }
            if spec
                .metadata
                .plugin_id
                .as_deref()
                .is_some_and(|owner| FOREIGN_PLUGIN_OWNERS.contains(&owner))
            {
                return false;
            }
            true
        })
        .collect();

    // Conda-style double registration: a spec pointing at another spec
    // file shadows the spec loaded from that file.
    let shadowed: HashSet<PathBuf> = connections
        .iter()
        .filter_map(|connection| {
            let spec = connection.spec()?;
            let original = spec
                .metadata
                .nbkernel
                .as_ref()?
                .original_spec_file
                .clone()?;
            (spec.spec_file.as_ref() != Some(&original)).then_some(original)
        })
        .collect();
    connections.retain(|connection| {
        connection
            .spec()
            .and_then(|spec| spec.spec_file.as_ref())
            .map_or(true, |spec_file| !shadowed.contains(spec_file))
    });

    // Same display name and same executable collapse to one entry; same
    // display name with a different executable stays.
    let mut seen_ids: HashSet<ConnectionId> = HashSet::new();
    let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
    connections.retain(|connection| {
        if !seen_ids.insert(connection.id()) {
            return false;
        }
        if let Some(spec) = connection.spec() {
            let pair = (
                spec.display_name.clone(),
                spec.executable().unwrap_or_default().to_string(),
            );
            if !seen_pairs.insert(pair) {
                return false;
            }
        }
        true
    });

    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbkernel_core::kernelspec::{
        HostBookkeeping, InterruptMode, SpecMetadata,
    };
    use nbkernel_core::KernelSpec;
    use std::collections::HashMap;

    fn spec(name: &str, display_name: &str, argv0: &str, spec_file: Option<&str>) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            display_name: display_name.to_string(),
            language: "python".to_string(),
            argv: vec![argv0.to_string()],
            env: HashMap::new(),
            interrupt_mode: InterruptMode::Signal,
            metadata: SpecMetadata::default(),
            interpreter_path: None,
            spec_file: spec_file.map(PathBuf::from),
        }
    }

    fn connection(spec: KernelSpec) -> KernelConnection {
        KernelConnection::Spec {
            spec,
            interpreter: None,
        }
    }

    #[test]
    fn test_filter_drops_xpython() {
        let connections = vec![
            connection(spec("a", "A", "/usr/bin/xpython", None)),
            connection(spec("b", "B", "/usr/bin/python3", None)),
        ];
        let filtered = apply_filters(connections);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].display_name(), "B");
    }

    #[test]
    fn test_filter_drops_foreign_plugin_registrations() {
        let mut foreign = spec("a", "A", "python", None);
        foreign.metadata.plugin_id = Some("azureml.kernels".to_string());
        let connections = vec![
            connection(foreign),
            connection(spec("b", "B", "python", None)),
        ];
        let filtered = apply_filters(connections);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].display_name(), "B");
    }

    #[test]
    fn test_filter_suppresses_conda_double_registration() {
        let mut conda = spec(
            "py",
            "Python (conda)",
            "/opt/conda/bin/python",
            Some("/opt/conda/envs/e/share/jupyter/kernels/py/kernel.json"),
        );
        conda.metadata.nbkernel = Some(HostBookkeeping {
            original_spec_file: Some(PathBuf::from(
                "/usr/share/jupyter/kernels/py/kernel.json",
            )),
            original_display_name: None,
            registration_info: None,
        });
        let global = spec(
            "py",
            "Python 3",
            "/usr/bin/python3",
            Some("/usr/share/jupyter/kernels/py/kernel.json"),
        );

        let filtered = apply_filters(vec![connection(conda), connection(global)]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].display_name(), "Python (conda)");
    }

    #[test]
    fn test_filter_collapses_equal_display_and_executable() {
        let connections = vec![
            connection(spec("a", "Python 3", "/usr/bin/python3", Some("/a/kernel.json"))),
            connection(spec("b", "Python 3", "/usr/bin/python3", Some("/b/kernel.json"))),
            connection(spec("c", "Python 3", "/opt/conda/bin/python", Some("/c/kernel.json"))),
        ];
        let filtered = apply_filters(connections);
        // Same display + same argv[0] collapse; different argv[0] survives
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_filter_dedupes_by_id() {
        let duplicated = connection(spec("a", "A", "python", Some("/a/kernel.json")));
        let filtered = apply_filters(vec![duplicated.clone(), duplicated]);
        assert_eq!(filtered.len(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        prop_compose! {
            fn arb_connection()(
                name in "[a-z]{1,6}",
                display_name in "[A-Z][a-z]{0,5}",
                argv0 in prop::sample::select(vec![
                    "/usr/bin/python3",
                    "/opt/conda/bin/python",
                    "/usr/bin/xpython",
                    "R",
                ]),
                spec_file in prop::option::of("[a-z]{1,6}"),
            ) -> KernelConnection {
                connection(spec(
                    &name,
                    &display_name,
                    argv0,
                    spec_file.map(|stem| format!("/{stem}/kernel.json")).as_deref(),
                ))
            }
        }

        proptest! {
            /// Filtering is idempotent and never yields duplicate ids.
            #[test]
            fn filtering_is_idempotent_with_unique_ids(
                connections in prop::collection::vec(arb_connection(), 0..12)
            ) {
                let filtered = apply_filters(connections);
                let ids: HashSet<ConnectionId> =
                    filtered.iter().map(KernelConnection::id).collect();
                prop_assert_eq!(ids.len(), filtered.len());

                let again = apply_filters(filtered.clone());
                prop_assert_eq!(again, filtered);
            }

            /// No surviving entry launches the legacy wasm variant.
            #[test]
            fn no_xpython_survives(
                connections in prop::collection::vec(arb_connection(), 0..12)
            ) {
                let filtered = apply_filters(connections);
                let none_is_xpython = filtered.iter().all(|connection| {
                    connection
                        .spec()
                        .and_then(|spec| spec.executable())
                        .map_or(true, |executable| !executable.ends_with("xpython"))
                });
                prop_assert!(none_is_xpython);
            }
        }
    }
}
