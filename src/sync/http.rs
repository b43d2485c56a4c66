//! HTTP datasource synchronizer.
//!
//! Fetches one document per datasource and lands it under the datasource's
//! `path` in the source's staging tree as `data.json`. The staging directory
//! is wiped before every pass.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::config::{Datasource, SecretValue};

use super::{Metadata, Synchronizer};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpSynchronizer {
    source: String,
    datasources: Vec<(Datasource, Option<SecretValue>)>,
    staging: PathBuf,
    client: reqwest::Client,
}

impl HttpSynchronizer {
    pub fn new(
        source: impl Into<String>,
        datasources: Vec<(Datasource, Option<SecretValue>)>,
        staging: PathBuf,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            source: source.into(),
            datasources,
            staging,
            client,
        })
    }

    async fn fetch(&self, ds: &Datasource, credentials: Option<&SecretValue>) -> Result<Vec<u8>> {
        let url = ds
            .url
            .as_deref()
            .with_context(|| format!("datasource {:?} has no url", ds.name))?;
        let mut request = self.client.get(url);
        match credentials {
            None => {}
            Some(SecretValue::BasicAuth { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            Some(SecretValue::TokenAuth { token }) => {
                request = request.bearer_auth(token);
            }
            Some(other) => bail!(
                "datasource {:?}: unsupported credential type for http: {}",
                ds.name,
                other.kind()
            ),
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("fetch {url}"))?;
        if !response.status().is_success() {
            bail!(
                "datasource {:?}: {url} returned {}",
                ds.name,
                response.status()
            );
        }
        Ok(response.bytes().await.context("read response body")?.to_vec())
    }
}

#[async_trait]
impl Synchronizer for HttpSynchronizer {
    fn source(&self) -> &str {
        &self.source
    }

    async fn execute(&mut self) -> Result<Metadata> {
        tokio::fs::create_dir_all(&self.staging)
            .await
            .with_context(|| format!("create staging dir {}", self.staging.display()))?;

        let mut fetched = Vec::new();
        for (ds, credentials) in &self.datasources {
            let bytes = self.fetch(ds, credentials.as_ref()).await?;
            // Require valid JSON here so a bad upstream fails the sync
            // phase, not the build.
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .with_context(|| format!("datasource {:?}: response is not JSON", ds.name))?;

            let target = self
                .staging
                .join(crate::vfs::normalize(&ds.path))
                .join("data.json");
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("create datasource dir {}", parent.display())
                })?;
            }
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("write {}", target.display()))?;
            info!(source = %self.source, datasource = %ds.name, bytes = bytes.len(), "fetched datasource");
            fetched.push(ds.name.clone());
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("type".to_string(), json!("http"));
        metadata.insert("datasources".to_string(), json!(fetched));
        Ok(metadata)
    }

    fn wipe_dir(&self) -> Option<PathBuf> {
        Some(self.staging.clone())
    }
}
