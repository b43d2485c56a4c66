//! Glob include/exclude overlay over a backing filesystem.

use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::{join, normalize, DirEntry, FsError, Filesystem, Node};

/// Wraps a backing filesystem and hides files according to glob lists.
///
/// An empty include list admits every file; the exclude list always wins.
/// Directories stay visible so traversal can reach nested matches.
pub struct FilteredFs {
    inner: Arc<dyn Filesystem>,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl FilteredFs {
    pub fn new(
        inner: Arc<dyn Filesystem>,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, FsError> {
        Ok(Self {
            inner,
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    fn visible(&self, path: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>, FsError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| FsError::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|source| FsError::Glob {
        pattern: patterns.join(","),
        source,
    })?;
    Ok(Some(set))
}

impl Filesystem for FilteredFs {
    fn open(&self, path: &str) -> Result<Node, FsError> {
        let path = normalize(path);
        match self.inner.open(&path)? {
            Node::Dir => Ok(Node::Dir),
            Node::File(bytes) => {
                if self.visible(&path) {
                    Ok(Node::File(bytes))
                } else {
                    Err(FsError::NotFound(path))
                }
            }
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize(path);
        let entries = self.inner.read_dir(&path)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir || self.visible(&join(&path, &e.name)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{walk_files, MapFs};

    fn sample() -> Arc<dyn Filesystem> {
        let mut fs = MapFs::new();
        fs.insert("policy/main.rego", b"package main".to_vec());
        fs.insert("policy/main_test.rego", b"package main".to_vec());
        fs.insert("data/users.json", b"{}".to_vec());
        Arc::new(fs)
    }

    #[test]
    fn test_exclude_hides_files() {
        let fs = FilteredFs::new(sample(), &[], &["**/*_test.rego".to_string()]).unwrap();
        let files = walk_files(&fs).unwrap();
        let paths: Vec<_> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["data/users.json", "policy/main.rego"]);
        assert!(matches!(
            fs.open("policy/main_test.rego"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_include_limits_files() {
        let fs = FilteredFs::new(sample(), &["**/*.rego".to_string()], &[]).unwrap();
        let files = walk_files(&fs).unwrap();
        assert!(files.iter().all(|(p, _)| p.ends_with(".rego")));
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        assert!(FilteredFs::new(sample(), &["[".to_string()], &[]).is_err());
    }
}
