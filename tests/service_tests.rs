//! End-to-end service tests: load a config into the store, run the service
//! in single-shot mode and check the published bundle artifact and status.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::{json, Value};
use tokio::sync::watch;

use bundle_control_plane::config::{
    encode_files, Bundle, Config, ObjectStorageConfig, Requirement, Service as ServiceConfig,
    Source,
};
use bundle_control_plane::migrations::{Dialect, Migrator};
use bundle_control_plane::service::Service;
use bundle_control_plane::store::{Caller, Store};

fn service_config(data_dir: PathBuf) -> ServiceConfig {
    ServiceConfig {
        listen: "127.0.0.1:0".to_string(),
        data_dir,
        workers: 1,
        reload_interval: "30s".to_string(),
        error_interval: "30s".to_string(),
    }
}

fn bundle_to(name: &str, path: PathBuf, requirements: &[&str]) -> Bundle {
    Bundle {
        name: name.to_string(),
        tenant: "default".to_string(),
        labels: BTreeMap::new(),
        object_storage: ObjectStorageConfig::Filesystem { path },
        excluded_files: Vec::new(),
        rebuild_interval: None,
        requirements: requirements
            .iter()
            .map(|r| Requirement {
                source: Some((*r).to_string()),
                ..Default::default()
            })
            .collect(),
        revision: None,
        options: Default::default(),
    }
}

async fn run_single_shot(config: &Config) -> Arc<Store> {
    let store = Arc::new(
        Store::connect(&config.database.url, Dialect::Sqlite)
            .await
            .expect("connect"),
    );
    Migrator::new(store.pool().clone(), Dialect::Sqlite)
        .run()
        .await
        .expect("migrate");

    let service = Service::new(store.clone(), &config.service, true).expect("service");
    service.load_config(config).await.expect("load config");

    let (_tx, rx) = watch::channel(false);
    service.run(rx).await.expect("run service");
    store
}

fn read_entries(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut out = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        out.insert(path, content);
    }
    out
}

#[tokio::test]
async fn test_single_shot_builds_builtin_source() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out/bundle.tar.gz");

    let mut files = BTreeMap::new();
    files.insert(
        "rules/main.rego".to_string(),
        b"package rules\n\nallow := true\n".to_vec(),
    );
    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();
    config.service = service_config(tmp.path().join("data"));
    config.sources.insert(
        "policies".to_string(),
        Source {
            name: "policies".to_string(),
            tenant: "default".to_string(),
            builtin: true,
            files: encode_files(&files),
            ..Default::default()
        },
    );
    config
        .bundles
        .insert("prod".to_string(), bundle_to("prod", out.clone(), &["policies"]));

    let store = run_single_shot(&config).await;

    let bytes = std::fs::read(&out).expect("bundle artifact written");
    let entries = read_entries(&bytes);
    let manifest: Value = serde_json::from_slice(&entries[".manifest"]).unwrap();
    assert_eq!(manifest["roots"], json!(["rules"]));
    assert!(entries
        .keys()
        .any(|p| p.starts_with("policies/") && p.ends_with("main.rego")));

    let sidecar: Value = serde_json::from_slice(
        &std::fs::read(tmp.path().join("out/bundle.tar.gz.metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["sha256"].as_str().unwrap().len(), 64);

    let status = store
        .get_bundle_status(&Caller::internal("default"), "prod")
        .await
        .unwrap()
        .expect("status recorded");
    assert_eq!(status.state, "Synced");
    assert!(status.sha256.is_some());
}

#[tokio::test]
async fn test_pushed_data_reaches_bundle_with_revision() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out/bundle.tar.gz");

    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();
    config.service = service_config(tmp.path().join("data"));
    config.sources.insert(
        "datasrc".to_string(),
        Source {
            name: "datasrc".to_string(),
            tenant: "default".to_string(),
            ..Default::default()
        },
    );
    let mut bundle = bundle_to("prod", out.clone(), &["datasrc"]);
    bundle.revision = Some("\"r-${input.sources.datasrc.type}\"".to_string());
    config.bundles.insert("prod".to_string(), bundle);

    let store = Arc::new(
        Store::connect(&config.database.url, Dialect::Sqlite)
            .await
            .unwrap(),
    );
    Migrator::new(store.pool().clone(), Dialect::Sqlite)
        .run()
        .await
        .unwrap();

    let service = Service::new(store.clone(), &config.service, true).unwrap();
    service.load_config(&config).await.unwrap();

    let caller = Caller::internal("default");
    store
        .put_source_data(&caller, "datasrc", "users/data.json", &json!({"alice": 1}))
        .await
        .unwrap();

    let (_tx, rx) = watch::channel(false);
    service.run(rx).await.unwrap();

    let entries = read_entries(&std::fs::read(&out).unwrap());
    let manifest: Value = serde_json::from_slice(&entries[".manifest"]).unwrap();
    assert_eq!(manifest["revision"], "r-database");
    assert_eq!(manifest["roots"], json!(["users"]));
    let data: Value = serde_json::from_slice(&entries["data.json"]).unwrap();
    assert_eq!(data, json!({"users": {"alice": 1}}));

    let status = store.get_bundle_status(&caller, "prod").await.unwrap().unwrap();
    assert_eq!(status.state, "Synced");
    assert_eq!(status.revision.as_deref(), Some("r-database"));
}
