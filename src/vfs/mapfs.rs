//! In-memory path → bytes filesystem.

use std::collections::BTreeMap;

use super::{child_segments, normalize, DirEntry, FsError, Filesystem, Node};

/// In-memory filesystem. Directories are implied by the file paths.
#[derive(Debug, Default, Clone)]
pub struct MapFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl MapFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(files: BTreeMap<String, Vec<u8>>) -> Self {
        let files = files
            .into_iter()
            .map(|(path, bytes)| (normalize(&path), bytes))
            .collect();
        Self { files }
    }

    pub fn insert(&mut self, path: &str, bytes: Vec<u8>) {
        self.files.insert(normalize(path), bytes);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn has_dir(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.files.keys().any(|k| k.starts_with(&prefix))
    }
}

impl Filesystem for MapFs {
    fn open(&self, path: &str) -> Result<Node, FsError> {
        let path = normalize(path);
        if path == "." {
            return Ok(Node::Dir);
        }
        if let Some(bytes) = self.files.get(&path) {
            return Ok(Node::File(bytes.clone()));
        }
        if self.has_dir(&path) {
            return Ok(Node::Dir);
        }
        Err(FsError::NotFound(path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = normalize(path);
        if path != "." && !self.has_dir(&path) {
            return Err(FsError::NotFound(path));
        }
        let entries = child_segments(self.files.keys().map(String::as_str), &path);
        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }
}
