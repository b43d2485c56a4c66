//! # Bundle Builder
//!
//! Resolves a bundle's transitive source closure, overlays per-bundle
//! exclusion filters and per-edge namespace mounts, detects package-root
//! conflicts and compiles the merged virtual filesystem into an OPA bundle
//! archive.
//!
//! The worklist is keyed by `(source, mounts)`: a source required twice
//! through different mount chains is processed twice, because the mount
//! chain changes where its packages land in the merged namespace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub mod archive;
pub mod graph;
pub mod revision;
pub mod rewrite;
pub mod roots;
pub mod transform;

pub use graph::{sort_sources, CycleError};
pub use revision::Metadata;
pub use roots::PackageConflictErr;
pub use transform::Transform;

use crate::vfs::{dirname, is_empty, walk_files, FilteredFs, Filesystem, MapFs, MountFs};
use rewrite::{module_package, relocate, rewrite_package};
use roots::{canonical, Ref, RootSet};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    PackageConflict(#[from] PackageConflictErr),
    #[error("missing source {0:?}")]
    MissingSource(String),
    #[error("module {path}: missing package declaration")]
    MissingPackage { path: String },
    #[error("transform {path}: {message}")]
    Transform { path: String, message: String },
    #[error("data merge at {path}: {message}")]
    DataMerge { path: String, message: String },
    #[error("decode {path}: {message}")]
    Decode { path: String, message: String },
    #[error("encode {path}: {message}")]
    Encode { path: String, message: String },
    #[error("unsupported compile target {0:?}")]
    UnsupportedTarget(String),
    #[error(transparent)]
    Fs(#[from] crate::vfs::FsError),
    #[error("write bundle: {0}")]
    Io(#[from] std::io::Error),
}

/// A namespace mount: `sub` selects a subtree of the source's data space,
/// `prefix` relocates it. Either side may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Mount {
    pub sub: Vec<String>,
    pub prefix: Vec<String>,
}

impl Mount {
    pub fn new(sub: &str, prefix: &str) -> Self {
        Self {
            sub: rewrite::parse_ref(sub),
            prefix: rewrite::parse_ref(prefix),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sub.is_empty() && self.prefix.is_empty()
    }
}

/// A dependency edge to another source, optionally mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub source: String,
    pub commit: Option<String>,
    pub mount: Option<Mount>,
}

/// A source with its resolved filesystems, ready to build.
pub struct BuildSource {
    pub name: String,
    pub filesystems: Vec<Arc<dyn Filesystem>>,
    pub requirements: Vec<Requirement>,
    pub transforms: Vec<Transform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Rego,
    Plan,
    Wasm,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rego" => Ok(Target::Rego),
            "plan" => Ok(Target::Plan),
            "wasm" => Ok(Target::Wasm),
            other => Err(format!("unknown compile target {other:?}")),
        }
    }
}

pub struct Builder {
    sources: Vec<BuildSource>,
    excluded: Vec<String>,
    target: Target,
    revision: String,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Item {
    source: String,
    mounts: Vec<Mount>,
}

impl Builder {
    /// `sources[0]` is the primary source; the rest are candidates reachable
    /// through requirements.
    pub fn new(sources: Vec<BuildSource>) -> Self {
        Self {
            sources,
            excluded: Vec::new(),
            target: Target::default(),
            revision: String::new(),
        }
    }

    pub fn with_excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn build<W: Write>(&self, out: W) -> Result<(), BuildError> {
        let prepared = self.apply_transforms()?;
        let index: HashMap<&str, &PreparedSource> =
            prepared.iter().map(|s| (s.name.as_str(), s)).collect();

        let primary = prepared
            .first()
            .ok_or_else(|| BuildError::MissingSource(String::new()))?;

        let mut merged = MountFs::new();
        let mut roots = RootSet::new();
        let mut counters: HashMap<String, usize> = HashMap::new();
        let mut processed: HashSet<Item> = HashSet::new();
        let mut queue: VecDeque<Item> = VecDeque::new();

        let initial = Item {
            source: primary.name.clone(),
            mounts: Vec::new(),
        };
        processed.insert(initial.clone());
        queue.push_back(initial);

        while let Some(item) = queue.pop_front() {
            let source = index
                .get(item.source.as_str())
                .ok_or_else(|| BuildError::MissingSource(item.source.clone()))?;

            let mut item_roots: Vec<Ref> = Vec::new();
            for fs in &source.filesystems {
                let filtered: Arc<dyn Filesystem> =
                    Arc::new(FilteredFs::new(fs.clone(), &[], &self.excluded)?);
                let (fs, fs_roots) = process_fs(&filtered, &item.mounts)?;
                if is_empty(fs.as_ref())? {
                    continue;
                }
                item_roots.extend(fs_roots);
                let n = counters.entry(source.name.clone()).or_insert(0);
                merged.mount(&format!("{}/{}", source.name, n), fs);
                *n += 1;
            }

            roots.check_and_add(&item.source, &source.name, canonical(item_roots))?;

            for req in &source.requirements {
                let mut mounts = Vec::new();
                if let Some(mount) = &req.mount {
                    if !mount.is_identity() {
                        mounts.push(mount.clone());
                    }
                }
                mounts.extend(item.mounts.iter().cloned());
                let next = Item {
                    source: req.source.clone(),
                    mounts,
                };
                if processed.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }

        match self.target {
            Target::Rego => {
                archive::write_bundle(out, &merged, &roots.manifest_roots(), &self.revision)
            }
            Target::Plan => Err(BuildError::UnsupportedTarget("plan".to_string())),
            Target::Wasm => Err(BuildError::UnsupportedTarget("wasm".to_string())),
        }
    }

    /// Run each source's transforms, replacing target files in place.
    /// Sources with transforms are materialized into memory first.
    fn apply_transforms(&self) -> Result<Vec<PreparedSource>, BuildError> {
        let mut prepared = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let filesystems = if source.transforms.is_empty() {
                source.filesystems.clone()
            } else {
                let mut maps: Vec<MapFs> = Vec::with_capacity(source.filesystems.len());
                for fs in &source.filesystems {
                    let mut map = MapFs::new();
                    for (path, bytes) in walk_files(fs.as_ref())? {
                        map.insert(&path, bytes);
                    }
                    maps.push(map);
                }
                for transform in &source.transforms {
                    run_transform(&mut maps, transform)?;
                }
                maps.into_iter()
                    .map(|m| Arc::new(m) as Arc<dyn Filesystem>)
                    .collect()
            };
            prepared.push(PreparedSource {
                name: source.name.clone(),
                filesystems,
                requirements: source.requirements.clone(),
            });
        }
        Ok(prepared)
    }
}

struct PreparedSource {
    name: String,
    filesystems: Vec<Arc<dyn Filesystem>>,
    requirements: Vec<Requirement>,
}

fn run_transform(maps: &mut [MapFs], transform: &Transform) -> Result<(), BuildError> {
    let path = crate::vfs::normalize(&transform.path);
    for map in maps.iter_mut() {
        let Ok(crate::vfs::Node::File(bytes)) = map.open(&path) else {
            continue;
        };
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| BuildError::Transform {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let result = transform::apply(&transform.query, &doc).map_err(|e| BuildError::Transform {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let bytes = serde_json::to_vec(&result).map_err(|e| BuildError::Transform {
            path: path.clone(),
            message: e.to_string(),
        })?;
        map.insert(&path, bytes);
        return Ok(());
    }
    Err(BuildError::Transform {
        path,
        message: "target file not found".to_string(),
    })
}

/// Apply a mount chain to one filesystem, collecting the package roots it
/// contributes.
///
/// Without mounts the filesystem passes through untouched. With mounts,
/// every Rego module is renamed (or discarded when its package falls outside
/// the mounted subtree) and every data file is relocated, producing a fresh
/// in-memory tree.
fn process_fs(
    fs: &Arc<dyn Filesystem>,
    mounts: &[Mount],
) -> Result<(Arc<dyn Filesystem>, Vec<Ref>), BuildError> {
    let mut fs_roots: Vec<Ref> = Vec::new();

    if mounts.is_empty() {
        for (path, bytes) in walk_files(fs.as_ref())? {
            if path.ends_with(".rego") {
                let content = String::from_utf8_lossy(&bytes);
                let package = module_package(&content)
                    .ok_or_else(|| BuildError::MissingPackage { path: path.clone() })?;
                fs_roots.push(package);
            } else if is_data_file(&path) {
                fs_roots.push(dir_segments(&path));
            }
        }
        return Ok((fs.clone(), fs_roots));
    }

    let mut out = MapFs::new();
    for (path, bytes) in walk_files(fs.as_ref())? {
        if path.ends_with(".rego") {
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let package = module_package(&content)
                .ok_or_else(|| BuildError::MissingPackage { path: path.clone() })?;
            let Some(renamed) = apply_mounts(&package, mounts) else {
                continue;
            };
            let rewritten = rewrite_package(&content, &renamed);
            out.insert(&path, rewritten.into_bytes());
            fs_roots.push(renamed);
        } else if is_data_file(&path) {
            let dir = dir_segments(&path);
            let Some(relocated) = apply_mounts(&dir, mounts) else {
                continue;
            };
            let file_name = path.rsplit('/').next().unwrap_or(&path);
            let mut new_path = relocated.clone();
            new_path.push(file_name.to_string());
            out.insert(&new_path.join("/"), bytes);
            fs_roots.push(relocated);
        }
    }
    Ok((Arc::new(out), fs_roots))
}

/// Compose a mount chain over a namespace path, innermost mount first.
fn apply_mounts(path: &[String], mounts: &[Mount]) -> Option<Vec<String>> {
    let mut current = path.to_vec();
    for mount in mounts {
        current = relocate(&current, &mount.sub, &mount.prefix)?;
    }
    Some(current)
}

fn is_data_file(path: &str) -> bool {
    path.ends_with(".json") || path.ends_with(".yml") || path.ends_with(".yaml")
}

fn dir_segments(path: &str) -> Vec<String> {
    let dir = dirname(path);
    if dir == "." {
        Vec::new()
    } else {
        dir.split('/').map(str::to_string).collect()
    }
}
