//! # Object Storage
//!
//! The two-method contract bundle artifacts are shipped through. Drivers
//! are pluggable; the filesystem driver is built in and the cloud variants
//! (S3, GCS, Azure Blob) are deployment-provided.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::ObjectStorageConfig;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store the bundle bytes with `sha256` metadata and, when non-empty,
    /// the revision string.
    async fn upload(&self, bytes: Vec<u8>, revision: &str) -> Result<()>;

    /// Return the most recently uploaded bundle bytes.
    async fn download(&self) -> Result<Vec<u8>>;
}

/// Instantiate the driver for a bundle's storage config.
pub fn from_config(config: &ObjectStorageConfig) -> Result<Box<dyn ObjectStorage>> {
    match config {
        ObjectStorageConfig::Filesystem { path } => {
            Ok(Box::new(FilesystemStorage::new(path.clone())))
        }
        ObjectStorageConfig::Aws { bucket, .. } => {
            bail!("no S3 driver is linked into this build (bucket {bucket:?})")
        }
        ObjectStorageConfig::Gcp { bucket, .. } => {
            bail!("no GCS driver is linked into this build (bucket {bucket:?})")
        }
        ObjectStorageConfig::Azure { container, .. } => {
            bail!("no Azure Blob driver is linked into this build (container {container:?})")
        }
    }
}

#[derive(Serialize)]
struct SidecarMetadata<'a> {
    sha256: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    revision: &'a str,
}

/// Local filesystem driver; metadata lands in a JSON sidecar next to the
/// artifact.
pub struct FilesystemStorage {
    path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn metadata_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle.tar.gz".to_string());
        name.push_str(".metadata.json");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn upload(&self, bytes: Vec<u8>, revision: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if parent != Path::new("") {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let sha256 = hex_digest(&bytes);
        let size = bytes.len();
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        let metadata = serde_json::to_vec_pretty(&SidecarMetadata {
            sha256: sha256.clone(),
            revision,
        })?;
        tokio::fs::write(self.metadata_path(), metadata)
            .await
            .with_context(|| format!("write {}", self.metadata_path().display()))?;
        info!(path = %self.path.display(), size, sha256 = %sha256, "bundle uploaded");
        Ok(())
    }

    async fn download(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
