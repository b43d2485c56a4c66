//! Database synchronizer.
//!
//! Exports a source's `sources_data` rows (content pushed through the
//! management API) into the staging tree so the builder sees them as plain
//! files. The staging directory is wiped before every pass.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::store::{Caller, Store};

use super::{Metadata, Synchronizer};

pub struct DatabaseSynchronizer {
    source: String,
    store: Arc<Store>,
    caller: Caller,
    staging: PathBuf,
}

impl DatabaseSynchronizer {
    pub fn new(source: impl Into<String>, store: Arc<Store>, caller: Caller, staging: PathBuf) -> Self {
        Self {
            source: source.into(),
            store,
            caller,
            staging,
        }
    }
}

#[async_trait]
impl Synchronizer for DatabaseSynchronizer {
    fn source(&self) -> &str {
        &self.source
    }

    async fn execute(&mut self) -> Result<Metadata> {
        let rows = self
            .store
            .list_source_data(&self.caller, &self.source)
            .await
            .with_context(|| format!("load data rows for source {:?}", self.source))?;

        tokio::fs::create_dir_all(&self.staging)
            .await
            .with_context(|| format!("create staging dir {}", self.staging.display()))?;

        let count = rows.len();
        for (path, bytes) in rows {
            let target = self.staging.join(&path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create data dir {}", parent.display()))?;
            }
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("write {}", target.display()))?;
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("type".to_string(), json!("database"));
        metadata.insert("files".to_string(), json!(count));
        Ok(metadata)
    }

    fn wipe_dir(&self) -> Option<PathBuf> {
        Some(self.staging.clone())
    }
}
