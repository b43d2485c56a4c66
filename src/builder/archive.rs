//! OPA bundle archive writer.
//!
//! Produces the gzipped tarball consumed by policy enforcement points:
//! `.manifest` (roots + rego version), the Rego modules, and a consolidated
//! `data.json` assembled from every JSON/YAML data file in the merged tree.
//! Entry metadata is pinned (mtime 0, uid/gid 0) so identical inputs produce
//! byte-identical archives.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;

use crate::vfs::{dirname, walk_files, MountFs};

use super::BuildError;

#[derive(Serialize)]
struct Manifest<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    revision: &'a str,
    roots: &'a [String],
    rego_version: u8,
}

pub fn write_bundle<W: Write>(
    out: W,
    fs: &MountFs,
    roots: &[String],
    revision: &str,
) -> Result<(), BuildError> {
    let gz = GzEncoder::new(out, Compression::default());
    let mut tar = tar::Builder::new(gz);

    let manifest = serde_json::to_vec(&Manifest {
        revision,
        roots,
        rego_version: 0,
    })
    .map_err(|e| BuildError::Encode {
        path: ".manifest".to_string(),
        message: e.to_string(),
    })?;
    append_file(&mut tar, ".manifest", &manifest)?;

    let mut data = Value::Null;
    let mut modules = Vec::new();
    for (key, mounted) in fs.mounts() {
        for (path, bytes) in walk_files(mounted.as_ref())? {
            if path.ends_with(".rego") {
                modules.push((format!("{key}/{path}"), bytes));
            } else if let Some(doc) = parse_data_file(&path, &bytes)? {
                let dir = dirname(&path);
                let segments: Vec<&str> = if dir == "." {
                    Vec::new()
                } else {
                    dir.split('/').collect()
                };
                insert_at(&mut data, &segments, doc).map_err(|message| BuildError::DataMerge {
                    path: format!("{key}/{path}"),
                    message,
                })?;
            }
        }
    }

    for (path, bytes) in modules {
        append_file(&mut tar, &path, &bytes)?;
    }

    if !matches!(data, Value::Null) {
        let bytes = serde_json::to_vec(&data).map_err(|e| BuildError::Encode {
            path: "data.json".to_string(),
            message: e.to_string(),
        })?;
        append_file(&mut tar, "data.json", &bytes)?;
    }

    tar.into_inner()?.finish()?;
    Ok(())
}

fn parse_data_file(path: &str, bytes: &[u8]) -> Result<Option<Value>, BuildError> {
    let decode = |message: String| BuildError::Decode {
        path: path.to_string(),
        message,
    };
    if path.ends_with(".json") {
        let doc = serde_json::from_slice(bytes).map_err(|e| decode(e.to_string()))?;
        Ok(Some(doc))
    } else if path.ends_with(".yml") || path.ends_with(".yaml") {
        let doc = serde_yaml::from_slice(bytes).map_err(|e| decode(e.to_string()))?;
        Ok(Some(doc))
    } else {
        Ok(None)
    }
}

fn append_file<W: Write>(
    tar: &mut tar::Builder<W>,
    path: &str,
    bytes: &[u8],
) -> Result<(), BuildError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    tar.append_data(&mut header, path, bytes)?;
    Ok(())
}

/// Insert `doc` at `segments` in the data tree, deep-merging objects.
pub(crate) fn insert_at(tree: &mut Value, segments: &[&str], doc: Value) -> Result<(), String> {
    if segments.is_empty() {
        return merge_values(tree, doc);
    }
    if matches!(tree, Value::Null) {
        *tree = Value::Object(serde_json::Map::new());
    }
    let mut node = tree;
    for (i, segment) in segments.iter().enumerate() {
        let map = node
            .as_object_mut()
            .ok_or_else(|| format!("{} is not an object", segments[..i].join("/")))?;
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    merge_values(node, doc).map_err(|e| format!("{}: {e}", segments.join("/")))
}

/// Deep-merge `src` into `dst`. Any non-object collision is an error; the
/// message carries the key path where the trees disagree.
pub(crate) fn merge_values(dst: &mut Value, src: Value) -> Result<(), String> {
    match (dst, src) {
        (dst @ Value::Null, src) => {
            *dst = src;
            Ok(())
        }
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_value) in src_map {
                match dst_map.get_mut(&key) {
                    Some(dst_value) => {
                        merge_values(dst_value, src_value).map_err(|e| format!("{key}: {e}"))?;
                    }
                    None => {
                        dst_map.insert(key, src_value);
                    }
                }
            }
            Ok(())
        }
        (_, _) => Err("conflicting values".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MapFs;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;
    use std::sync::Arc;

    fn read_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((path, content));
        }
        out
    }

    #[test]
    fn test_bundle_layout() {
        let mut map = MapFs::new();
        map.insert("main.rego", b"package app\n".to_vec());
        map.insert("users/data.json", br#"{"alice": 1}"#.to_vec());
        let mut fs = MountFs::new();
        fs.mount("system/0", Arc::new(map));

        let mut bytes = Vec::new();
        write_bundle(&mut bytes, &fs, &["app".to_string(), "users".to_string()], "r1").unwrap();

        let entries = read_entries(&bytes);
        let paths: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec![".manifest", "system/0/main.rego", "data.json"]);

        let manifest: Value = serde_json::from_slice(&entries[0].1).unwrap();
        assert_eq!(
            manifest,
            json!({"revision": "r1", "roots": ["app", "users"], "rego_version": 0})
        );
        let data: Value = serde_json::from_slice(&entries[2].1).unwrap();
        assert_eq!(data, json!({"users": {"alice": 1}}));
    }

    #[test]
    fn test_identical_inputs_identical_bytes() {
        let mut map = MapFs::new();
        map.insert("a/data.json", b"{}".to_vec());
        let mut fs = MountFs::new();
        fs.mount("s/0", Arc::new(map));

        let mut one = Vec::new();
        let mut two = Vec::new();
        write_bundle(&mut one, &fs, &["a".to_string()], "same").unwrap();
        write_bundle(&mut two, &fs, &["a".to_string()], "same").unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_merge_conflict() {
        let mut tree = Value::Null;
        insert_at(&mut tree, &["a", "b"], json!(2)).unwrap();
        let err = insert_at(&mut tree, &["a"], json!({"b": {"c": 3}})).unwrap_err();
        assert!(err.contains("conflicting values"));
    }

    #[test]
    fn test_merge_disjoint() {
        let mut tree = Value::Null;
        insert_at(&mut tree, &["a"], json!({"x": 1})).unwrap();
        insert_at(&mut tree, &["a"], json!({"y": 2})).unwrap();
        assert_eq!(tree, json!({"a": {"x": 1, "y": 2}}));
    }
}
