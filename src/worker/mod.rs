//! # Bundle Worker
//!
//! Per-bundle reconciliation: each scheduled pass runs
//! `Sync → Transform → Build → Upload → Report`. A failing phase is
//! recorded on the bundle's status and retried after the error interval;
//! success reschedules after the bundle's rebuild interval. When the
//! service observes a config change it marks the worker, which retires on
//! its next tick and is replaced with a fresh one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::builder::{
    revision, sort_sources, BuildError, BuildSource, Builder, Mount, Requirement, Transform,
};
use crate::config::{decode_files, Bundle, Source, Stack};
use crate::observability::metrics;
use crate::pool::Task;
use crate::storage::ObjectStorage;
use crate::store::{BundleStatus, Caller, Store};
use crate::sync::Synchronizer;
use crate::vfs::{join, FilteredFs, Filesystem, MapFs, OsFs};

/// The in-store view of a bundle a worker was built from.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub bundle: Bundle,
    pub sources: Vec<Source>,
    pub stacks: Vec<Stack>,
}

impl WorkerConfig {
    /// Equality under requirement-set semantics across all three
    /// collections.
    pub fn same(&self, other: &WorkerConfig) -> bool {
        if !self.bundle.same(&other.bundle) {
            return false;
        }
        let by_name = |sources: &[Source]| {
            let mut v = sources.to_vec();
            v.sort_by(|a, b| a.name.cmp(&b.name));
            v
        };
        let (a, b) = (by_name(&self.sources), by_name(&other.sources));
        if a.len() != b.len() || !a.iter().zip(&b).all(|(x, y)| x.same(y)) {
            return false;
        }
        let by_name = |stacks: &[Stack]| {
            let mut v = stacks.to_vec();
            v.sort_by(|a, b| a.name.cmp(&b.name));
            v
        };
        let (a, b) = (by_name(&self.stacks), by_name(&other.stacks));
        a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| x.same(y))
    }
}

/// Handle shared between the service and a running worker.
pub struct WorkerShared {
    config: Mutex<WorkerConfig>,
    changed: AtomicBool,
    retired: AtomicBool,
}

impl WorkerShared {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            changed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        })
    }

    /// Called by the service when the in-store view changes. If any of the
    /// three collections differs the worker retires on its next tick.
    pub fn update_config(&self, bundle: &Bundle, sources: &[Source], stacks: &[Stack]) {
        let current = self.config.lock().expect("worker config mutex poisoned");
        let next = WorkerConfig {
            bundle: bundle.clone(),
            sources: sources.to_vec(),
            stacks: stacks.to_vec(),
        };
        if !current.same(&next) {
            self.changed.store(true, Ordering::SeqCst);
        }
    }

    /// Force retirement regardless of config comparison (bundle deleted).
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Whether this worker's bundle consumes `source` in `tenant`.
    pub fn uses_source(&self, tenant: &str, source: &str) -> bool {
        let config = self.config.lock().expect("worker config mutex poisoned");
        config.bundle.tenant == tenant && config.sources.iter().any(|s| s.name == source)
    }

    fn config(&self) -> WorkerConfig {
        self.config.lock().expect("worker config mutex poisoned").clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sync,
    Transform,
    Build,
    Push,
    Internal,
}

impl Phase {
    fn state(self) -> &'static str {
        match self {
            Phase::Sync => "SyncFailed",
            Phase::Transform => "TransformFailed",
            Phase::Build => "BuildFailed",
            Phase::Push => "PushFailed",
            Phase::Internal => "InternalError",
        }
    }
}

struct TickError {
    phase: Phase,
    error: anyhow::Error,
}

fn phase_err<E: Into<anyhow::Error>>(phase: Phase) -> impl FnOnce(E) -> TickError {
    move |e| TickError {
        phase,
        error: e.into(),
    }
}

struct TickOutcome {
    revision: String,
    sha256: String,
}

pub struct BundleWorker {
    shared: Arc<WorkerShared>,
    store: Arc<Store>,
    storage: Box<dyn ObjectStorage>,
    synchronizers: Vec<Box<dyn Synchronizer>>,
    caller: Caller,
    /// Staging root for this bundle; each source syncs under
    /// `sources/<name>/…`.
    data_dir: PathBuf,
    rebuild_interval: Duration,
    error_interval: Duration,
    single_shot: bool,
}

impl BundleWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<WorkerShared>,
        store: Arc<Store>,
        storage: Box<dyn ObjectStorage>,
        synchronizers: Vec<Box<dyn Synchronizer>>,
        caller: Caller,
        data_dir: PathBuf,
        rebuild_interval: Duration,
        error_interval: Duration,
        single_shot: bool,
    ) -> Self {
        Self {
            shared,
            store,
            storage,
            synchronizers,
            caller,
            data_dir,
            rebuild_interval,
            error_interval,
            single_shot,
        }
    }

    /// Staging directory layout shared with the service.
    pub fn source_staging(data_dir: &std::path::Path, source: &str, kind: &str) -> PathBuf {
        data_dir.join("sources").join(source).join(kind)
    }

    async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        // Wipe staging that starts from scratch; git working copies stay.
        for synchronizer in &self.synchronizers {
            if let Some(dir) = synchronizer.wipe_dir() {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(phase_err(Phase::Internal)(e)),
                }
            }
        }

        let mut metadata: BTreeMap<String, revision::Metadata> = BTreeMap::new();
        for synchronizer in &mut self.synchronizers {
            let meta = synchronizer
                .execute()
                .await
                .map_err(phase_err(Phase::Sync))?;
            metadata
                .entry(synchronizer.source().to_string())
                .or_default()
                .extend(meta);
        }

        let config = self.shared.config();
        let build_sources = self
            .assemble_sources(&config)
            .map_err(phase_err(Phase::Build))?;

        let env: BTreeMap<String, String> = std::env::vars().collect();
        let rev = match &config.bundle.revision {
            Some(expr) => revision::evaluate(expr, &metadata, &env)
                .map_err(phase_err(Phase::Build))?,
            None => String::new(),
        };

        let target = config
            .bundle
            .target()
            .map_err(|e| phase_err(Phase::Build)(anyhow!(e.to_string())))?;
        let excluded = config.bundle.excluded_files.clone();
        let revision_for_build = rev.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            Builder::new(build_sources)
                .with_excluded(excluded)
                .with_target(target)
                .with_revision(revision_for_build)
                .build(&mut out)?;
            Ok::<Vec<u8>, BuildError>(out)
        })
        .await
        .map_err(|e| phase_err(Phase::Internal)(anyhow!(e)))?
        .map_err(|e| match &e {
            BuildError::Transform { .. } => phase_err(Phase::Transform)(anyhow!(e.to_string())),
            _ => phase_err(Phase::Build)(anyhow!(e.to_string())),
        })?;

        let sha256 = hex_digest(&bytes);
        self.storage
            .upload(bytes, &rev)
            .await
            .map_err(phase_err(Phase::Push))?;
        metrics::increment_uploads();

        Ok(TickOutcome {
            revision: rev,
            sha256,
        })
    }

    /// Resolve the snapshot into builder inputs: a synthetic primary source
    /// carrying the bundle's (and matched stacks') requirements, followed by
    /// the configured sources in dependency order.
    fn assemble_sources(&self, config: &WorkerConfig) -> Result<Vec<BuildSource>, anyhow::Error> {
        let nodes: Vec<(String, Vec<String>)> = config
            .sources
            .iter()
            .map(|s| (s.name.clone(), s.requirement_names()))
            .collect();
        let order = sort_sources(&nodes)?;

        let mut primary_requirements: Vec<Requirement> = config
            .bundle
            .requirements
            .iter()
            .filter_map(to_builder_requirement)
            .collect();
        for stack in &config.stacks {
            if stack.matches(&config.bundle.labels) {
                primary_requirements.extend(stack.requirements.iter().filter_map(to_builder_requirement));
            }
        }

        let mut out = vec![BuildSource {
            name: config.bundle.name.clone(),
            filesystems: Vec::new(),
            requirements: primary_requirements,
            transforms: Vec::new(),
        }];

        let by_name: BTreeMap<&str, &Source> =
            config.sources.iter().map(|s| (s.name.as_str(), s)).collect();
        for name in order {
            let Some(source) = by_name.get(name.as_str()) else {
                continue;
            };
            out.push(self.assemble_source(source)?);
        }
        Ok(out)
    }

    fn assemble_source(&self, source: &Source) -> Result<BuildSource, anyhow::Error> {
        let mut filesystems: Vec<Arc<dyn Filesystem>> = Vec::new();

        if let Some(git) = &source.git {
            let mut dir = Self::source_staging(&self.data_dir, &source.name, "repo");
            if let Some(path) = &git.path {
                dir = dir.join(path);
            }
            if dir.is_dir() {
                let fs: Arc<dyn Filesystem> = Arc::new(OsFs::new(dir));
                let fs = FilteredFs::new(fs, &git.included_files, &git.excluded_files)
                    .map_err(|e| anyhow!("source {:?}: {e}", source.name))?;
                filesystems.push(Arc::new(fs));
            }
        }
        for kind in ["http", "db"] {
            let dir = Self::source_staging(&self.data_dir, &source.name, kind);
            if dir.is_dir() {
                filesystems.push(Arc::new(OsFs::new(dir)));
            }
        }
        if !source.files.is_empty() {
            let files = decode_files(&source.files).map_err(|e| anyhow!(e))?;
            filesystems.push(Arc::new(MapFs::from_map(files)));
        }

        let transforms = source
            .datasources
            .iter()
            .filter_map(|ds| {
                ds.transform_query.as_ref().map(|query| Transform {
                    path: join(&ds.path, "data.json"),
                    query: query.clone(),
                })
            })
            .collect();

        Ok(BuildSource {
            name: source.name.clone(),
            filesystems,
            requirements: source
                .requirements
                .iter()
                .filter_map(to_builder_requirement)
                .collect(),
            transforms,
        })
    }

    async fn report(&self, status: BundleStatus) {
        let bundle = self.shared.config().bundle.name.clone();
        if let Err(e) = self
            .store
            .set_bundle_status(&self.caller, &bundle, &status)
            .await
        {
            error!(bundle = %bundle, error = %e, "failed to record bundle status");
        }
    }
}

fn to_builder_requirement(req: &crate::config::Requirement) -> Option<Requirement> {
    let source = req.source.clone()?;
    let mount = match (&req.path, &req.prefix) {
        (None, None) => None,
        (path, prefix) => Some(Mount::new(
            path.as_deref().unwrap_or(""),
            prefix.as_deref().unwrap_or(""),
        )),
    };
    Some(Requirement {
        source,
        commit: req.git.as_ref().and_then(|g| g.commit.clone()),
        mount,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl Task for BundleWorker {
    async fn run(&mut self) -> Option<Instant> {
        if self.shared.is_changed() {
            for synchronizer in &mut self.synchronizers {
                synchronizer.close().await;
            }
            self.shared.retired.store(true, Ordering::SeqCst);
            info!(bundle = %self.shared.config().bundle.name, "worker retiring after config change");
            return None;
        }

        let bundle = self.shared.config().bundle.name.clone();
        let started = std::time::Instant::now();
        let outcome = self.tick().await;
        metrics::observe_build_duration(started.elapsed().as_secs_f64());

        let deadline = match outcome {
            Ok(TickOutcome { revision, sha256 }) => {
                metrics::increment_builds();
                info!(bundle = %bundle, revision = %revision, "bundle reconciled");
                self.report(BundleStatus {
                    state: "Synced".to_string(),
                    message: None,
                    revision: (!revision.is_empty()).then_some(revision),
                    sha256: Some(sha256),
                    last_updated: Some(chrono::Utc::now()),
                })
                .await;
                Instant::now() + self.rebuild_interval
            }
            Err(TickError { phase, error }) => {
                metrics::increment_build_errors(phase.state());
                warn!(bundle = %bundle, phase = phase.state(), error = %error, "bundle pass failed");
                self.report(BundleStatus {
                    state: phase.state().to_string(),
                    message: Some(error.to_string()),
                    revision: None,
                    sha256: None,
                    last_updated: Some(chrono::Utc::now()),
                })
                .await;
                Instant::now() + self.error_interval
            }
        };

        if self.single_shot {
            self.shared.retired.store(true, Ordering::SeqCst);
            return None;
        }
        Some(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectStorageConfig;

    fn bundle(reqs: &[&str]) -> Bundle {
        Bundle {
            name: "b".to_string(),
            tenant: "default".to_string(),
            labels: BTreeMap::new(),
            object_storage: ObjectStorageConfig::Filesystem {
                path: PathBuf::from("out.tar.gz"),
            },
            excluded_files: Vec::new(),
            rebuild_interval: None,
            requirements: reqs
                .iter()
                .map(|r| crate::config::Requirement {
                    source: Some((*r).to_string()),
                    ..Default::default()
                })
                .collect(),
            revision: None,
            options: Default::default(),
        }
    }

    #[test]
    fn test_worker_config_requirement_order_is_irrelevant() {
        let a = WorkerConfig {
            bundle: bundle(&["x", "y"]),
            sources: Vec::new(),
            stacks: Vec::new(),
        };
        let b = WorkerConfig {
            bundle: bundle(&["y", "x"]),
            sources: Vec::new(),
            stacks: Vec::new(),
        };
        assert!(a.same(&b));
    }

    #[test]
    fn test_worker_config_detects_new_requirement() {
        let a = WorkerConfig {
            bundle: bundle(&["x"]),
            sources: Vec::new(),
            stacks: Vec::new(),
        };
        let b = WorkerConfig {
            bundle: bundle(&["x", "z"]),
            sources: Vec::new(),
            stacks: Vec::new(),
        };
        assert!(!a.same(&b));
    }

    #[test]
    fn test_update_config_marks_changed() {
        let shared = WorkerShared::new(WorkerConfig {
            bundle: bundle(&["x"]),
            sources: Vec::new(),
            stacks: Vec::new(),
        });
        shared.update_config(&bundle(&["x"]), &[], &[]);
        assert!(!shared.is_changed());
        shared.update_config(&bundle(&["x", "y"]), &[], &[]);
        assert!(shared.is_changed());
    }
}
