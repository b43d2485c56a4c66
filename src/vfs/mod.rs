//! # Virtual Filesystem Layer
//!
//! Composable read-only filesystem abstractions consumed by the bundle
//! builder. The merged tree handed to the compiler can have leaves backed by
//! live OS directories ([`OsFs`]), in-memory maps ([`MapFs`]), glob-filtered
//! views ([`FilteredFs`]) and prefix mounts ([`MountFs`]) without
//! materializing anything on disk.
//!
//! Paths are forward-slash separated and relative; `"."` names the root.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

mod filtered;
mod mapfs;
mod mountfs;

pub use filtered::FilteredFs;
pub use mapfs::MapFs;
pub use mountfs::MountFs;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// A node returned by [`Filesystem::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
}

/// A single directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Read-only filesystem over normalized relative paths.
pub trait Filesystem: Send + Sync {
    /// Open the node at `path` (`"."` is the root).
    fn open(&self, path: &str) -> Result<Node, FsError>;

    /// List the directory at `path`, sorted by name.
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
}

/// Strip `./` prefixes and trailing slashes; empty becomes `"."`.
pub fn normalize(path: &str) -> String {
    let trimmed = path
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Join two relative paths, treating `"."` as identity.
pub fn join(base: &str, rest: &str) -> String {
    let base = normalize(base);
    let rest = normalize(rest);
    if base == "." {
        rest
    } else if rest == "." {
        base
    } else {
        format!("{base}/{rest}")
    }
}

/// Parent directory of `path` (`"."` when there is none).
pub fn dirname(path: &str) -> String {
    let path = normalize(path);
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

/// Depth-first listing of every file under `fs`, sorted by path.
pub fn walk_files(fs: &dyn Filesystem) -> Result<Vec<(String, Vec<u8>)>, FsError> {
    let mut out = Vec::new();
    walk_into(fs, ".", &mut out)?;
    Ok(out)
}

fn walk_into(
    fs: &dyn Filesystem,
    dir: &str,
    out: &mut Vec<(String, Vec<u8>)>,
) -> Result<(), FsError> {
    for entry in fs.read_dir(dir)? {
        let path = join(dir, &entry.name);
        if entry.is_dir {
            walk_into(fs, &path, out)?;
        } else if let Node::File(bytes) = fs.open(&path)? {
            out.push((path, bytes));
        }
    }
    Ok(())
}

/// True when `fs` contains no files at all.
pub fn is_empty(fs: &dyn Filesystem) -> Result<bool, FsError> {
    fn scan(fs: &dyn Filesystem, dir: &str) -> Result<bool, FsError> {
        for entry in fs.read_dir(dir)? {
            let path = join(dir, &entry.name);
            if entry.is_dir {
                if !scan(fs, &path)? {
                    return Ok(false);
                }
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }
    scan(fs, ".")
}

/// View of a subtree of `inner` rooted at `root`.
pub struct SubFs {
    inner: Arc<dyn Filesystem>,
    root: String,
}

impl SubFs {
    pub fn new(inner: Arc<dyn Filesystem>, root: &str) -> Self {
        Self {
            inner,
            root: normalize(root),
        }
    }
}

impl Filesystem for SubFs {
    fn open(&self, path: &str) -> Result<Node, FsError> {
        self.inner.open(&join(&self.root, path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.inner.read_dir(&join(&self.root, path))
    }
}

/// Filesystem backed by an OS directory.
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let path = normalize(path);
        if path == "." {
            return Ok(self.root.clone());
        }
        let rel = Path::new(&path);
        // Relative traversal would escape the staging directory.
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(FsError::InvalidPath(path));
        }
        Ok(self.root.join(rel))
    }
}

impl Filesystem for OsFs {
    fn open(&self, path: &str) -> Result<Node, FsError> {
        let full = self.resolve(path)?;
        let meta = std::fs::metadata(&full).map_err(|e| io_err(path, e))?;
        if meta.is_dir() {
            Ok(Node::Dir)
        } else {
            let bytes = std::fs::read(&full).map_err(|e| io_err(path, e))?;
            Ok(Node::File(bytes))
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let full = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&full).map_err(|e| io_err(path, e))? {
            let entry = entry.map_err(|e| io_err(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".git" {
                continue;
            }
            let is_dir = entry.file_type().map_err(|e| io_err(path, e))?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn io_err(path: &str, source: std::io::Error) -> FsError {
    if source.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound(path.to_string())
    } else {
        FsError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Collect the sorted first segments of a set of paths relative to `dir`.
pub(crate) fn child_segments<'a>(
    keys: impl Iterator<Item = &'a str>,
    dir: &str,
) -> BTreeMap<String, bool> {
    let prefix = if dir == "." {
        String::new()
    } else {
        format!("{dir}/")
    };
    let mut out = BTreeMap::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.split_once('/') {
            Some((seg, _)) => {
                out.insert(seg.to_string(), true);
            }
            None => {
                out.entry(rest.to_string()).or_insert(false);
            }
        }
    }
    out
}
