//! Builder integration tests: source closures, namespace mounts, package
//! conflicts and archive determinism.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::Value;

use bundle_control_plane::builder::{
    BuildError, BuildSource, Builder, Mount, Requirement, Target,
};
use bundle_control_plane::vfs::{Filesystem, MapFs};

fn map_fs(files: &[(&str, &str)]) -> Arc<dyn Filesystem> {
    let mut fs = MapFs::new();
    for (path, content) in files {
        fs.insert(path, content.as_bytes().to_vec());
    }
    Arc::new(fs)
}

fn source(name: &str, files: &[(&str, &str)], requirements: Vec<Requirement>) -> BuildSource {
    BuildSource {
        name: name.to_string(),
        filesystems: if files.is_empty() {
            Vec::new()
        } else {
            vec![map_fs(files)]
        },
        requirements,
        transforms: Vec::new(),
    }
}

fn require(name: &str) -> Requirement {
    Requirement {
        source: name.to_string(),
        commit: None,
        mount: None,
    }
}

fn require_mounted(name: &str, sub: &str, prefix: &str) -> Requirement {
    Requirement {
        source: name.to_string(),
        commit: None,
        mount: Some(Mount::new(sub, prefix)),
    }
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

fn manifest(entries: &BTreeMap<String, Vec<u8>>) -> Value {
    serde_json::from_slice(&entries[".manifest"]).unwrap()
}

#[test]
fn test_package_conflict_between_sources() {
    let sources = vec![
        source("bundle", &[], vec![require("system"), require("lib1")]),
        source("system", &[("main.rego", "package x\n\na := 1\n")], vec![]),
        source("lib1", &[("y.rego", "package x.y\n\nb := 2\n")], vec![]),
    ];

    let err = Builder::new(sources).build(&mut Vec::new()).unwrap_err();
    let BuildError::PackageConflict(conflict) = err else {
        panic!("expected a package conflict, got {err}");
    };
    assert_eq!(
        conflict.to_string(),
        "requirement \"lib1\" contains conflicting package x.y"
    );
    assert!(conflict
        .overlap
        .contains(&"package x from \"system\"".to_string()));
}

#[test]
fn test_mount_chains_compose_inner_first() {
    let sources = vec![
        source("bundle", &[], vec![require("system")]),
        source(
            "system",
            &[("sys.rego", "package system\n\nallow := true\n")],
            vec![require_mounted("lib1", "data", "data.imported")],
        ),
        source(
            "lib1",
            &[("one.rego", "package lib1\n\nc := 3\n")],
            vec![require_mounted("lib2", "data", "data.abc")],
        ),
        source(
            "lib2",
            &[("q.rego", "package lib2.q\n\nd := 4\n")],
            vec![],
        ),
    ];

    let mut bytes = Vec::new();
    Builder::new(sources).build(&mut bytes).unwrap();
    let entries = read_entries(&bytes);

    let module = entries
        .iter()
        .find(|(path, _)| path.ends_with("q.rego"))
        .map(|(_, content)| String::from_utf8_lossy(content).into_owned())
        .expect("lib2 module present");
    assert!(
        module.starts_with("package imported.abc.lib2.q\n"),
        "unexpected module: {module}"
    );

    let roots = manifest(&entries)["roots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(roots.contains(&"system".to_string()));
    assert!(roots.contains(&"imported/lib1".to_string()));
    assert!(roots.contains(&"imported/abc/lib2/q".to_string()));
}

#[test]
fn test_manifest_roots_are_prefix_free() {
    let sources = vec![
        source("bundle", &[], vec![require("a"), require("b")]),
        source(
            "a",
            &[
                ("p.rego", "package alpha\n\nx := 1\n"),
                ("q.rego", "package alpha.deep\n\ny := 2\n"),
            ],
            vec![],
        ),
        source("b", &[("data/users/data.json", "{\"u\": 1}")], vec![]),
    ];

    let mut bytes = Vec::new();
    Builder::new(sources).build(&mut bytes).unwrap();
    let entries = read_entries(&bytes);
    let roots: Vec<String> = manifest(&entries)["roots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r.as_str().unwrap().to_string())
        .collect();

    for (i, a) in roots.iter().enumerate() {
        for (j, b) in roots.iter().enumerate() {
            if i != j {
                assert!(
                    !format!("{b}/").starts_with(&format!("{a}/")),
                    "root {a:?} is a prefix of {b:?}"
                );
            }
        }
    }
}

#[test]
fn test_identical_inputs_build_identical_bundles() {
    let build = || {
        let sources = vec![
            source("bundle", &[], vec![require("sys")]),
            source(
                "sys",
                &[
                    ("main.rego", "package sys\n\nallow := false\n"),
                    ("cfg/data.json", "{\"mode\": \"strict\"}"),
                ],
                vec![],
            ),
        ];
        let mut bytes = Vec::new();
        Builder::new(sources)
            .with_revision("pinned")
            .build(&mut bytes)
            .unwrap();
        bytes
    };
    assert_eq!(build(), build());
}

#[test]
fn test_missing_required_source_fails() {
    let sources = vec![source("bundle", &[], vec![require("ghost")])];
    let err = Builder::new(sources).build(&mut Vec::new()).unwrap_err();
    assert_eq!(err.to_string(), "missing source \"ghost\"");
}

#[test]
fn test_excluded_files_are_filtered_out() {
    let sources = vec![
        source("bundle", &[], vec![require("sys")]),
        source(
            "sys",
            &[
                ("main.rego", "package sys\n\nallow := true\n"),
                ("main_test.rego", "package sys\n\ntest_allow := true\n"),
            ],
            vec![],
        ),
    ];
    let mut bytes = Vec::new();
    Builder::new(sources)
        .with_excluded(vec!["*_test.rego".to_string()])
        .build(&mut bytes)
        .unwrap();
    let entries = read_entries(&bytes);
    assert!(entries.keys().any(|p| p.ends_with("main.rego")));
    assert!(!entries.keys().any(|p| p.ends_with("main_test.rego")));
}

#[test]
fn test_plan_and_wasm_targets_are_unsupported() {
    for target in [Target::Plan, Target::Wasm] {
        let sources = vec![source("bundle", &[], vec![])];
        let err = Builder::new(sources)
            .with_target(target)
            .build(&mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedTarget(_)));
    }
}

#[test]
fn test_data_lands_at_mounted_namespace() {
    let sources = vec![
        source("bundle", &[], vec![require_mounted("datasrc", "", "data.ext")]),
        source("datasrc", &[("users/data.json", "{\"alice\": true}")], vec![]),
    ];
    let mut bytes = Vec::new();
    Builder::new(sources).build(&mut bytes).unwrap();
    let entries = read_entries(&bytes);
    let data: Value = serde_json::from_slice(&entries["data.json"]).unwrap();
    assert_eq!(data["ext"]["users"]["alice"], Value::Bool(true));
}
