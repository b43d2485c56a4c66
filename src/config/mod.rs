//! # Configuration
//!
//! Declarative configuration for the control plane: bundles, sources,
//! stacks, secrets, tokens, database and service settings. Multiple files
//! are deep-merged (objects merge, later scalars win) before
//! deserialization; `--merge-conflict-fail` turns scalar conflicts into
//! errors naming the conflicting path.
//!
//! The same types double as the store's value model: entity rows persist the
//! serialized form in their `config` column.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod duration;
mod merge;
pub mod secrets;

pub use duration::parse_duration;
pub use merge::deep_merge;
pub use secrets::{SecretError, SecretValue};

use crate::builder::Target;
use crate::migrations::Dialect;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("merge conflict at {0}")]
    MergeConflict(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_role() -> String {
    "owner".to_string()
}

fn default_datasource_type() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bundles: BTreeMap<String, Bundle>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, Source>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stacks: BTreeMap<String, Stack>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, Secret>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, Token>,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub service: Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub object_storage: ObjectStorageConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "BundleOptions::is_default")]
    pub options: BundleOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleOptions {
    /// Compile target: `rego` (default), `plan` or `wasm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl BundleOptions {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl Bundle {
    pub fn target(&self) -> Result<Target, ConfigError> {
        match &self.options.target {
            None => Ok(Target::default()),
            Some(t) => t.parse().map_err(ConfigError::Validation),
        }
    }

    /// Equality under requirement-set semantics.
    pub fn same(&self, other: &Bundle) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.requirements.sort();
        b.requirements.sort();
        a == b
    }
}

/// One of the four supported object stores; the variant tag makes the
/// exactly-one invariant structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStorageConfig {
    Aws {
        bucket: String,
        key: String,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    Gcp {
        bucket: String,
        object: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    Azure {
        account_url: String,
        container: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    Filesystem {
        path: PathBuf,
    },
}

impl ObjectStorageConfig {
    pub fn credentials(&self) -> Option<&str> {
        match self {
            ObjectStorageConfig::Aws { credentials, .. }
            | ObjectStorageConfig::Gcp { credentials, .. }
            | ObjectStorageConfig::Azure { credentials, .. } => credentials.as_deref(),
            ObjectStorageConfig::Filesystem { .. } => None,
        }
    }
}

/// A dependency edge to a source, optionally pinned and mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRequirement>,
    /// Subtree of the required source's data space to take (`data.a.b`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Namespace the subtree is relocated to (`data.x.y`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GitRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub builtin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<Git>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasources: Vec<Datasource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    /// Embedded files (base64-encoded content), mostly for builtin sources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

impl Source {
    pub fn same(&self, other: &Source) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.requirements.sort();
        b.requirements.sort();
        a == b
    }

    pub fn requirement_names(&self) -> Vec<String> {
        self.requirements
            .iter()
            .filter_map(|r| r.source.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Git {
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Subdirectory of the working copy that holds the source content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_datasource_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Where the fetched document lands in the source's file tree.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_query: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclude_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
}

impl Stack {
    /// A stack applies to a bundle when its selector matches the bundle's
    /// labels and the exclude selector (if any) does not.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        selector_matches(&self.selector, labels)
            && !(!self.exclude_selector.is_empty()
                && selector_matches(&self.exclude_selector, labels))
    }

    pub fn same(&self, other: &Stack) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.requirements.sort();
        b.requirements.sort();
        a == b
    }
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|l| v == "*" || l == v))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Opaque JSON typed by `value.type`; see [`SecretValue`].
    #[serde(flatten)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    #[serde(default = "Database::default_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
}

impl Database {
    fn default_url() -> String {
        "sqlite://data.db?mode=rwc".to_string()
    }

    pub fn dialect(&self) -> Result<Dialect, ConfigError> {
        match &self.dialect {
            Some(name) => name.parse().map_err(ConfigError::Validation),
            None => Dialect::from_url(&self.url).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "cannot infer database dialect from url {:?}",
                    self.url
                ))
            }),
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            dialect: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default = "Service::default_listen")]
    pub listen: String,
    #[serde(default = "Service::default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "Service::default_workers")]
    pub workers: usize,
    #[serde(default = "Service::default_interval")]
    pub reload_interval: String,
    #[serde(default = "Service::default_interval")]
    pub error_interval: String,
}

impl Service {
    fn default_listen() -> String {
        "127.0.0.1:8282".to_string()
    }

    fn default_data_dir() -> PathBuf {
        PathBuf::from("data")
    }

    fn default_workers() -> usize {
        4
    }

    fn default_interval() -> String {
        "30s".to_string()
    }
}

impl Default for Service {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            data_dir: Self::default_data_dir(),
            workers: Self::default_workers(),
            reload_interval: Self::default_interval(),
            error_interval: Self::default_interval(),
        }
    }
}

impl Config {
    /// Load and deep-merge the given files, then validate.
    pub fn from_files(paths: &[PathBuf], conflict_fail: bool) -> Result<Self, ConfigError> {
        let mut merged = Value::Object(serde_json::Map::new());
        for path in paths {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let doc = parse_document(path, &text)?;
            deep_merge(&mut merged, doc, &mut Vec::new(), conflict_fail)?;
        }
        Self::from_value(merged)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let doc = parse_document(Path::new("<inline>"), text)?;
        Self::from_value(doc)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse {
                path: "<merged>".to_string(),
                message: e.to_string(),
            })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill entity names from their map keys.
    fn normalize(&mut self) {
        for (name, bundle) in &mut self.bundles {
            bundle.name = name.clone();
        }
        for (name, source) in &mut self.sources {
            source.name = name.clone();
            for (i, ds) in source.datasources.iter_mut().enumerate() {
                if ds.name.is_empty() {
                    ds.name = format!("{name}-{i}");
                }
            }
        }
        for (name, stack) in &mut self.stacks {
            stack.name = name.clone();
        }
        for (name, secret) in &mut self.secrets {
            secret.name = name.clone();
        }
        for (name, token) in &mut self.tokens {
            token.name = name.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for bundle in self.bundles.values() {
            check_globs(&bundle.name, &bundle.excluded_files)?;
            if let Some(interval) = &bundle.rebuild_interval {
                parse_duration(interval).map_err(ConfigError::Validation)?;
            }
            bundle.target()?;
            for req in &bundle.requirements {
                if req.source.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "bundle {:?}: requirement without a source",
                        bundle.name
                    )));
                }
            }
        }
        for source in self.sources.values() {
            if let Some(git) = &source.git {
                check_globs(&source.name, &git.included_files)?;
                check_globs(&source.name, &git.excluded_files)?;
            }
            for ds in &source.datasources {
                if ds.kind != "http" {
                    return Err(ConfigError::Validation(format!(
                        "source {:?}: unsupported datasource type {:?}",
                        source.name, ds.kind
                    )));
                }
                if ds.url.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "source {:?}: datasource {:?} has no url",
                        source.name, ds.name
                    )));
                }
            }
            decode_files(&source.files).map_err(|e| {
                ConfigError::Validation(format!("source {:?}: {e}", source.name))
            })?;
        }
        for secret in self.secrets.values() {
            secret
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        for token in self.tokens.values() {
            if token.api_key.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "token {:?} has an empty api_key",
                    token.name
                )));
            }
            if !matches!(
                token.role.as_str(),
                "administrator" | "viewer" | "owner" | "stack_owner"
            ) {
                return Err(ConfigError::Validation(format!(
                    "token {:?} has unknown role {:?}",
                    token.name, token.role
                )));
            }
        }
        parse_duration(&self.service.reload_interval).map_err(ConfigError::Validation)?;
        parse_duration(&self.service.error_interval).map_err(ConfigError::Validation)?;
        self.database.dialect()?;
        Ok(())
    }

    /// Every tenant named by any entity, plus the default.
    pub fn tenants(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::from([default_tenant()]);
        out.extend(self.bundles.values().map(|b| b.tenant.clone()));
        out.extend(self.sources.values().map(|s| s.tenant.clone()));
        out.extend(self.stacks.values().map(|s| s.tenant.clone()));
        out.extend(self.secrets.values().map(|s| s.tenant.clone()));
        out.extend(self.tokens.values().map(|t| t.tenant.clone()));
        out
    }
}

fn parse_document(path: &Path, text: &str) -> Result<Value, ConfigError> {
    // YAML is a superset of the JSON we accept, so one parser covers both
    // config formats.
    serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn check_globs(owner: &str, patterns: &[String]) -> Result<(), ConfigError> {
    for pattern in patterns {
        globset::Glob::new(pattern).map_err(|e| {
            ConfigError::Validation(format!("{owner:?}: glob {pattern:?}: {e}"))
        })?;
    }
    Ok(())
}

/// Decode a base64 file map into raw bytes.
pub fn decode_files(files: &BTreeMap<String, String>) -> Result<BTreeMap<String, Vec<u8>>, String> {
    let engine = base64::engine::general_purpose::STANDARD;
    files
        .iter()
        .map(|(path, content)| {
            engine
                .decode(content)
                .map(|bytes| (path.clone(), bytes))
                .map_err(|e| format!("file {path:?}: invalid base64: {e}"))
        })
        .collect()
}

/// Encode raw file contents into the base64 wire form.
pub fn encode_files(files: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    let engine = base64::engine::general_purpose::STANDARD;
    files
        .iter()
        .map(|(path, bytes)| (path.clone(), engine.encode(bytes)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
bundles:
  prod:
    labels:
      env: prod
    object_storage:
      filesystem:
        path: out/bundle.tar.gz
    excluded_files:
      - "**/*_test.rego"
    rebuild_interval: 60s
    requirements:
      - source: system
sources:
  system:
    git:
      repo: https://example.com/policy.git
      ref: main
      path: policies
stacks:
  base:
    selector:
      env: "*"
    requirements:
      - source: system
secrets:
  git-creds:
    type: basic_auth
    username: bob
    password: pw
tokens:
  admin-token:
    api_key: k-123
    role: administrator
database:
  url: "sqlite::memory:"
"#;

    #[test]
    fn test_parse_and_normalize() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.bundles["prod"].name, "prod");
        assert_eq!(config.bundles["prod"].tenant, "default");
        assert_eq!(config.sources["system"].git.as_ref().unwrap().reference.as_deref(), Some("main"));
        assert_eq!(config.tokens["admin-token"].role, "administrator");
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_files_round_trip() {
        let mut files = BTreeMap::new();
        files.insert("policy/main.rego".to_string(), b"package main\n".to_vec());
        files.insert("data/data.json".to_string(), vec![0u8, 159, 146, 150]);
        let encoded = encode_files(&files);
        assert_eq!(decode_files(&encoded).unwrap(), files);
    }

    #[test]
    fn test_bad_glob_fails_validation() {
        let bad = SAMPLE.replace("\"**/*_test.rego\"", "\"[\"");
        assert!(matches!(
            Config::from_yaml(&bad),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_stack_selector() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let stack = &config.stacks["base"];
        assert!(stack.matches(&BTreeMap::from([("env".to_string(), "prod".to_string())])));
        assert!(!stack.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_requirement_set_equality() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let mut other = config.bundles["prod"].clone();
        other.requirements = vec![
            Requirement {
                source: Some("extra".to_string()),
                ..Default::default()
            },
            Requirement {
                source: Some("system".to_string()),
                ..Default::default()
            },
        ];
        let mut reordered = other.clone();
        reordered.requirements.reverse();
        assert!(other.same(&reordered));
        assert!(!config.bundles["prod"].same(&other));
    }
}
