//! Store integration tests against an in-memory SQLite database: the full
//! migration chain, ownership-checked CRUD, authorization-scoped listings,
//! pagination and source-data conflict detection.

use std::path::PathBuf;

use serde_json::json;

use bundle_control_plane::config::{
    Bundle, ObjectStorageConfig, Requirement, Secret, Source, Stack, Token,
};
use bundle_control_plane::migrations::{Dialect, Migrator};
use bundle_control_plane::store::{
    decode_cursor, encode_cursor, Caller, ListOptions, PatchOp, Principal, Store, StoreError,
};

async fn setup() -> Store {
    let store = Store::connect("sqlite::memory:", Dialect::Sqlite)
        .await
        .expect("connect sqlite");
    Migrator::new(store.pool().clone(), Dialect::Sqlite)
        .run()
        .await
        .expect("run migrations");
    store
}

async fn setup_tenant(store: &Store, tenant: &str) -> Caller {
    let caller = Caller::internal(tenant);
    store.upsert_tenant(&caller, tenant).await.expect("create tenant");
    caller
}

async fn add_principal(store: &Store, tenant: &str, id: &str, role: &str) {
    let caller = Caller::internal(tenant);
    store
        .upsert_principal(
            &caller,
            &Principal {
                id: id.to_string(),
                role: role.to_string(),
                tenant: tenant.to_string(),
            },
        )
        .await
        .expect("create principal");
}

fn bundle(name: &str, requirements: &[&str]) -> Bundle {
    Bundle {
        name: name.to_string(),
        tenant: String::new(),
        labels: Default::default(),
        object_storage: ObjectStorageConfig::Filesystem {
            path: PathBuf::from(format!("out/{name}.tar.gz")),
        },
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

fn source(name: &str) -> Source {
    Source {
        name: name.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let store = setup().await;
    let migrator = Migrator::new(store.pool().clone(), Dialect::Sqlite);
    assert!(migrator.dry_run().await.unwrap().is_empty());
    migrator.run().await.unwrap();
}

#[tokio::test]
async fn test_internal_crud_round_trip() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;

    store.upsert_source(&caller, &source("system")).await.unwrap();
    store
        .upsert_bundle(&caller, &bundle("prod", &["system"]))
        .await
        .unwrap();

    let fetched = store.get_bundle(&caller, "prod").await.unwrap();
    assert_eq!(fetched.name, "prod");
    assert_eq!(fetched.tenant, "One");
    assert_eq!(
        fetched.requirements[0].source.as_deref(),
        Some("system")
    );

    let page = store.list_bundles(&caller, &ListOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(page.next_cursor.is_none());

    store.delete_bundle(&caller, "prod").await.unwrap();
    assert!(matches!(
        store.get_bundle(&caller, "prod").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn test_owner_creates_and_manages_only_their_resources() {
    let store = setup().await;
    let internal = setup_tenant(&store, "One").await;
    add_principal(&store, "One", "alice", "owner").await;
    add_principal(&store, "One", "eve", "owner").await;

    let alice = Caller::new("alice", "One");
    let eve = Caller::new("eve", "One");

    store.upsert_source(&alice, &source("app")).await.unwrap();

    // Creator holds the owner ACL on the name: update allowed.
    store.upsert_source(&alice, &source("app")).await.unwrap();

    // A different owner-role principal may neither update nor see it.
    assert!(matches!(
        store.upsert_source(&eve, &source("app")).await,
        Err(StoreError::NotAuthorized)
    ));
    assert!(matches!(
        store.get_source(&eve, "app").await,
        Err(StoreError::NotFound)
    ));
    let page = store.list_sources(&eve, &ListOptions::default()).await.unwrap();
    assert!(page.items.is_empty());

    // Deleting a missing resource is indistinguishable from an
    // unauthorized one.
    assert!(matches!(
        store.delete_source(&eve, "ghost").await,
        Err(StoreError::NotAuthorized)
    ));

    let _ = internal;
}

#[tokio::test]
async fn test_viewer_scopes() {
    let store = setup().await;
    let internal = setup_tenant(&store, "One").await;
    setup_tenant(&store, "Two").await;
    add_principal(&store, "One", "bob", "viewer").await;
    add_principal(&store, "Two", "carol", "viewer").await;

    store.upsert_source(&internal, &source("system")).await.unwrap();

    // A viewer sees the resources of their own tenant, read-only.
    let bob = Caller::new("bob", "One");
    let page = store.list_sources(&bob, &ListOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(matches!(
        store.upsert_source(&bob, &source("new")).await,
        Err(StoreError::NotAuthorized)
    ));

    // A viewer whose tenant holds nothing sees an empty page.
    let carol = Caller::new("carol", "Two");
    let page = store.list_sources(&carol, &ListOptions::default()).await.unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_cross_tenant_isolation() {
    let store = setup().await;
    let one = setup_tenant(&store, "One").await;
    let two = setup_tenant(&store, "Two").await;

    store.upsert_source(&one, &source("shared-name")).await.unwrap();
    store.upsert_source(&two, &source("shared-name")).await.unwrap();

    // Same name in both tenants; each sees exactly its own row.
    let page = store.list_sources(&one, &ListOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].tenant, "One");
    let page = store.list_sources(&two, &ListOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].tenant, "Two");
}

#[tokio::test]
async fn test_pagination_cursors() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;
    for i in 0..5 {
        store
            .upsert_bundle(&caller, &bundle(&format!("b{i}"), &[]))
            .await
            .unwrap();
    }

    let mut names = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = store
            .list_bundles(
                &caller,
                &ListOptions {
                    limit: Some(2),
                    cursor: cursor.clone(),
                },
            )
            .await
            .unwrap();
        pages += 1;
        names.extend(page.items.iter().map(|b| b.name.clone()));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(names, vec!["b0", "b1", "b2", "b3", "b4"]);
    assert!(pages >= 3);

    assert_eq!(decode_cursor(&encode_cursor(42)).unwrap(), 42);
}

#[tokio::test]
async fn test_source_delete_blocked_while_required() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;

    store.upsert_source(&caller, &source("base")).await.unwrap();
    store
        .upsert_bundle(&caller, &bundle("prod", &["base"]))
        .await
        .unwrap();

    let err = store.delete_source(&caller, "base").await.unwrap_err();
    match err {
        StoreError::ReferencedSource { source_name, requirer } => {
            assert_eq!(source_name, "base");
            assert_eq!(requirer, "prod");
        }
        other => panic!("expected ReferencedSource, got {other}"),
    }

    store.delete_bundle(&caller, "prod").await.unwrap();
    store.delete_source(&caller, "base").await.unwrap();
}

#[tokio::test]
async fn test_stack_requirements_block_source_delete() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;

    store.upsert_source(&caller, &source("base")).await.unwrap();
    let stack = Stack {
        name: "everything".to_string(),
        requirements: vec![Requirement {
            source: Some("base".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    };
    store.upsert_stack(&caller, &stack).await.unwrap();

    assert!(matches!(
        store.delete_source(&caller, "base").await,
        Err(StoreError::ReferencedSource { .. })
    ));
}

#[tokio::test]
async fn test_data_put_conflicts() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;
    store.upsert_source(&caller, &source("sys")).await.unwrap();

    // Scenario: an existing deeper row conflicts with a new object key
    // above it.
    store
        .put_source_data(&caller, "sys", "a/b/c/d/data.json", &json!(2))
        .await
        .unwrap();
    let err = store
        .put_source_data(&caller, "sys", "a/b/data.json", &json!({"c": 1}))
        .await
        .unwrap_err();
    match err {
        StoreError::DataConflict { paths } => {
            assert_eq!(paths, vec!["a/b/c/d/data.json".to_string()]);
        }
        other => panic!("expected DataConflict, got {other}"),
    }

    // Disjoint keys merge fine.
    store
        .put_source_data(&caller, "sys", "a/b/data.json", &json!({"x": 1}))
        .await
        .unwrap();

    // A non-object value conflicts with anything under its directory.
    assert!(matches!(
        store
            .put_source_data(&caller, "sys", "a/b/scalar.json", &json!(7))
            .await,
        Err(StoreError::DataConflict { .. })
    ));

    // Upward check: the new blob must merge with ancestor documents.
    store
        .put_source_data(&caller, "sys", "top/data.json", &json!({"leaf": {"v": 1}}))
        .await
        .unwrap();
    assert!(matches!(
        store
            .put_source_data(&caller, "sys", "top/leaf/v/data.json", &json!({"w": 2}))
            .await,
        Err(StoreError::DataConflict { .. })
    ));
}

#[tokio::test]
async fn test_data_round_trip_and_patch() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;
    store.upsert_source(&caller, &source("sys")).await.unwrap();

    store
        .put_source_data(&caller, "sys", "cfg/data.json", &json!({"mode": "strict"}))
        .await
        .unwrap();
    assert_eq!(
        store.get_source_data(&caller, "sys", "cfg/data.json").await.unwrap(),
        json!({"mode": "strict"})
    );

    store
        .patch_source_data(
            &caller,
            "sys",
            "cfg/data.json",
            &[
                PatchOp {
                    op: "replace".to_string(),
                    path: "/mode".to_string(),
                    value: json!("lenient"),
                },
                PatchOp {
                    op: "add".to_string(),
                    path: "/retries".to_string(),
                    value: json!(3),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_source_data(&caller, "sys", "cfg/data.json").await.unwrap(),
        json!({"mode": "lenient", "retries": 3})
    );

    store
        .delete_source_data(&caller, "sys", "cfg/data.json")
        .await
        .unwrap();
    assert!(matches!(
        store.get_source_data(&caller, "sys", "cfg/data.json").await,
        Err(StoreError::NotFound)
    ));

    let rows = store.list_source_data(&caller, "sys").await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_secret_listing_is_redacted() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;

    let secret = Secret {
        name: "git-creds".to_string(),
        tenant: "One".to_string(),
        value: json!({"type": "basic_auth", "username": "bob", "password": "pw"}),
    };
    store.upsert_secret(&caller, &secret).await.unwrap();

    let page = store.list_secrets(&caller, &ListOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].value, json!({"type": "basic_auth"}));

    let full = store.get_secret(&caller, "git-creds").await.unwrap();
    assert_eq!(full.value["password"], json!("pw"));
}

#[tokio::test]
async fn test_token_authentication() {
    let store = setup().await;
    let caller = setup_tenant(&store, "One").await;
    add_principal(&store, "One", "ci", "administrator").await;
    store
        .upsert_token(
            &caller,
            &Token {
                name: "ci".to_string(),
                api_key: "k-123".to_string(),
                role: "administrator".to_string(),
                tenant: "One".to_string(),
            },
        )
        .await
        .unwrap();

    let resolved = store.caller_by_api_key("k-123").await.unwrap().unwrap();
    assert_eq!(resolved, Caller::new("ci", "One"));
    assert!(store.caller_by_api_key("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_admin_has_full_tenant_access() {
    let store = setup().await;
    let internal = setup_tenant(&store, "One").await;
    add_principal(&store, "One", "root", "administrator").await;
    add_principal(&store, "One", "alice", "owner").await;

    let alice = Caller::new("alice", "One");
    store.upsert_source(&alice, &source("app")).await.unwrap();

    let admin = Caller::new("root", "One");
    assert_eq!(store.get_source(&admin, "app").await.unwrap().name, "app");
    store.upsert_source(&admin, &source("app")).await.unwrap();
    store.delete_source(&admin, "app").await.unwrap();

    let _ = internal;
}
