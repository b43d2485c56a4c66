//! Prefix-mounted composition of filesystems.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{child_segments, normalize, DirEntry, FsError, Filesystem, Node};

/// A mapping of path prefix → filesystem.
///
/// `open(name)` resolves in three steps: an exact mount match yields a
/// synthesized directory backed by the mounted filesystem; otherwise the
/// longest prefix match strips the prefix and recurses into the mount;
/// otherwise a directory is synthesized from the mount keys rooted at
/// `name`. `read_dir(".")` enumerates the first segment of every mount key.
#[derive(Default)]
pub struct MountFs {
    mounts: BTreeMap<String, Arc<dyn Filesystem>>,
}

impl MountFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, prefix: &str, fs: Arc<dyn Filesystem>) {
        self.mounts.insert(normalize(prefix), fs);
    }

    pub fn mounts(&self) -> impl Iterator<Item = (&str, &Arc<dyn Filesystem>)> {
        self.mounts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Longest mount prefix strictly containing `path`, with the remainder.
    fn resolve<'a>(&self, path: &'a str) -> Option<(&Arc<dyn Filesystem>, &'a str)> {
        let mut best: Option<(&String, &Arc<dyn Filesystem>, &str)> = None;
        for (key, fs) in &self.mounts {
            if let Some(rest) = path.strip_prefix(key.as_str()) {
                if let Some(rest) = rest.strip_prefix('/') {
                    if best.is_none_or(|(b, _, _)| key.len() > b.len()) {
                        best = Some((key, fs, rest));
                    }
                }
            }
        }
        best.map(|(_, fs, rest)| (fs, rest))
    }

    fn is_ancestor(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.mounts.keys().any(|k| k.starts_with(&prefix))
    }
}

impl Filesystem for MountFs {
    fn open(&self, path: &str) -> Result<Node, FsError> {
        let path = normalize(path);
        if path == "." || self.mounts.contains_key(&path) {
            return Ok(Node::Dir);
        }
        if let Some((fs, rest)) = self.resolve(&path) {
            return fs.open(rest);
        }
        if self.is_ancestor(&path) {
            return Ok(Node::Dir);
        }
        Err(FsError::NotFound(path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize(path);
        let mut entries: BTreeMap<String, bool> = BTreeMap::new();

        if let Some(fs) = self.mounts.get(&path) {
            for entry in fs.read_dir(".")? {
                entries.insert(entry.name, entry.is_dir);
            }
        } else if let Some((fs, rest)) = self.resolve(&path) {
            return fs.read_dir(if rest.is_empty() { "." } else { rest });
        }

        // Mount keys below `path` contribute synthesized directory entries.
        for (name, _) in child_segments(self.mounts.keys().map(String::as_str), &path) {
            entries.entry(name).or_insert(true);
        }

        if entries.is_empty() && path != "." && !self.mounts.contains_key(&path) {
            return Err(FsError::NotFound(path));
        }
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{walk_files, MapFs};

    fn mounted() -> MountFs {
        let mut lib = MapFs::new();
        lib.insert("rules.rego", b"package lib".to_vec());
        let mut app = MapFs::new();
        app.insert("main.rego", b"package app".to_vec());
        app.insert("data/data.json", b"{}".to_vec());

        let mut fs = MountFs::new();
        fs.mount("system/0", Arc::new(app));
        fs.mount("lib1/0", Arc::new(lib));
        fs
    }

    #[test]
    fn test_root_lists_first_segments() {
        let fs = mounted();
        let names: Vec<_> = fs.read_dir(".").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["lib1", "system"]);
    }

    #[test]
    fn test_exact_match_is_synthesized_dir() {
        let fs = mounted();
        assert_eq!(fs.open("system/0").unwrap(), Node::Dir);
        let names: Vec<_> = fs
            .read_dir("system/0")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["data", "main.rego"]);
    }

    #[test]
    fn test_longest_prefix_recurses() {
        let fs = mounted();
        assert!(matches!(fs.open("system/0/main.rego"), Ok(Node::File(_))));
        assert!(matches!(
            fs.open("system/0/data/data.json"),
            Ok(Node::File(_))
        ));
        assert!(matches!(fs.open("system/0/nope"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_ancestor_is_synthesized() {
        let fs = mounted();
        assert_eq!(fs.open("system").unwrap(), Node::Dir);
        let names: Vec<_> = fs.read_dir("system").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["0"]);
    }

    #[test]
    fn test_walk_spans_all_mounts() {
        let fs = mounted();
        let paths: Vec<_> = walk_files(&fs)
            .unwrap()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(
            paths,
            vec![
                "lib1/0/rules.rego",
                "system/0/data/data.json",
                "system/0/main.rego"
            ]
        );
    }
}
