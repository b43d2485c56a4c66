//! Per-source data storage.
//!
//! `sources_data` is a filesystem-shaped store: rows live at paths like
//! `a/b/data.json` and are merged into the source's file tree at build time.
//! A put must fail when merging it would be ambiguous, checked two ways:
//! downward (existing rows underneath the new document's keys) and upward
//! (the new blob must merge cleanly with every ancestor `data.json`).

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;

use crate::builder::archive::insert_at;
use crate::migrations::Dialect;
use crate::vfs::{dirname, normalize};

use super::{bind_all, Caller, SqlValue, Store, StoreError, Tx};

/// How many conflicting rows the diagnostic reports at most.
const CONFLICT_LIMIT: usize = 4;

impl Store {
    pub async fn put_source_data(
        &self,
        caller: &Caller,
        source: &str,
        path: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let path = checked_path(path)?;
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "manage", source).await? {
            return Err(StoreError::NotAuthorized);
        }
        let source_id = self
            .find_id(&mut tx, "sources", &caller.tenant, source)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.write_data_row(&mut tx, source_id, &path, value).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_source_data(
        &self,
        caller: &Caller,
        source: &str,
        path: &str,
    ) -> Result<Value, StoreError> {
        let path = checked_path(path)?;
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "view", source).await? {
            return Err(StoreError::NotAuthorized);
        }
        let source_id = self
            .find_id(&mut tx, "sources", &caller.tenant, source)
            .await?
            .ok_or(StoreError::NotFound)?;
        let sql = format!(
            "SELECT data FROM sources_data WHERE source_id = {} AND path = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(&path)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await?;
        decode_data(&path, &row.get::<String, _>(0))
    }

    pub async fn delete_source_data(
        &self,
        caller: &Caller,
        source: &str,
        path: &str,
    ) -> Result<(), StoreError> {
        let path = checked_path(path)?;
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "manage", source).await? {
            return Err(StoreError::NotAuthorized);
        }
        let source_id = self
            .find_id(&mut tx, "sources", &caller.tenant, source)
            .await?
            .ok_or(StoreError::NotFound)?;
        let sql = format!(
            "DELETE FROM sources_data WHERE source_id = {} AND path = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let result = sqlx::query(&sql)
            .bind(source_id)
            .bind(&path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// JSON Patch (add/remove/replace) against the document at `path`.
    pub async fn patch_source_data(
        &self,
        caller: &Caller,
        source: &str,
        path: &str,
        ops: &[PatchOp],
    ) -> Result<(), StoreError> {
        let path = checked_path(path)?;
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "manage", source).await? {
            return Err(StoreError::NotAuthorized);
        }
        let source_id = self
            .find_id(&mut tx, "sources", &caller.tenant, source)
            .await?
            .ok_or(StoreError::NotFound)?;
        let sql = format!(
            "SELECT data FROM sources_data WHERE source_id = {} AND path = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(&path)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        let mut doc = decode_data(&path, &row.get::<String, _>(0))?;
        apply_patch(&mut doc, ops).map_err(StoreError::Validation)?;
        self.write_data_row(&mut tx, source_id, &path, &doc).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every data row of a source, decoded; feeds the database synchronizer.
    pub async fn list_source_data(
        &self,
        caller: &Caller,
        source: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "view", source).await? {
            return Err(StoreError::NotAuthorized);
        }
        let source_id = self
            .find_id(&mut tx, "sources", &caller.tenant, source)
            .await?
            .ok_or(StoreError::NotFound)?;
        let sql = format!(
            "SELECT path, data FROM sources_data WHERE source_id = {} ORDER BY path",
            self.dialect.placeholder(1)
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        rows.iter()
            .map(|r| {
                let path = r.get::<String, _>(0);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(r.get::<String, _>(1))
                    .map_err(|e| StoreError::Validation(format!("data row {path:?}: {e}")))?;
                Ok((path, bytes))
            })
            .collect()
    }

    /// Conflict-checked write of one data row.
    async fn write_data_row(
        &self,
        tx: &mut Tx,
        source_id: i64,
        path: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.check_downward(tx, source_id, path, value).await?;
        self.check_upward(tx, source_id, path, value).await?;

        let p = |i| self.dialect.placeholder(i);
        let encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(value)?);
        let sql = match self.dialect {
            Dialect::Sqlite => format!(
                "INSERT OR REPLACE INTO sources_data (source_id, path, data) VALUES ({}, {}, {})",
                p(1),
                p(2),
                p(3)
            ),
            Dialect::Postgres | Dialect::Cockroach => format!(
                "INSERT INTO sources_data (source_id, path, data) VALUES ({}, {}, {}) \
                 ON CONFLICT (source_id, path) DO UPDATE SET data = EXCLUDED.data",
                p(1),
                p(2),
                p(3)
            ),
            Dialect::Mysql => format!(
                "INSERT INTO sources_data (source_id, path, data) VALUES ({}, {}, {}) \
                 ON DUPLICATE KEY UPDATE data = VALUES(data)",
                p(1),
                p(2),
                p(3)
            ),
        };
        sqlx::query(&sql)
            .bind(source_id)
            .bind(path)
            .bind(encoded)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Downward checks: an object value conflicts with rows underneath any
    /// of its keys; a non-object value conflicts with anything else under
    /// its directory.
    async fn check_downward(
        &self,
        tx: &mut Tx,
        source_id: i64,
        path: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let dir = dirname(path);
        let prefix = if dir == "." {
            String::new()
        } else {
            format!("{}/", escape_like(&dir))
        };
        let patterns: Vec<String> = match value.as_object() {
            Some(map) => map
                .keys()
                .map(|k| format!("{prefix}{}/%", escape_like(k)))
                .collect(),
            None => vec![format!("{prefix}%")],
        };
        if patterns.is_empty() {
            return Ok(());
        }

        let dialect = self.dialect;
        let mut args = vec![SqlValue::Int(source_id), SqlValue::Str(path.to_string())];
        let likes: Vec<String> = patterns
            .into_iter()
            .map(|pattern| {
                args.push(SqlValue::Str(pattern));
                format!("path LIKE {} ESCAPE '!'", dialect.placeholder(args.len()))
            })
            .collect();
        let sql = format!(
            "SELECT path FROM sources_data WHERE source_id = {} AND path <> {} AND ({}) \
             ORDER BY path LIMIT {CONFLICT_LIMIT}",
            dialect.placeholder(1),
            dialect.placeholder(2),
            likes.join(" OR ")
        );
        let rows = bind_all(sqlx::query(&sql), args).fetch_all(&mut **tx).await?;
        if rows.is_empty() {
            return Ok(());
        }
        Err(StoreError::DataConflict {
            paths: rows.iter().map(|r| r.get::<String, _>(0)).collect(),
        })
    }

    /// Upward check: the new blob must merge cleanly with the `data.json`
    /// documents at its own directory and every ancestor.
    async fn check_upward(
        &self,
        tx: &mut Tx,
        source_id: i64,
        path: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let mut candidates = Vec::new();
        let mut dir = dirname(path);
        loop {
            let candidate = if dir == "." {
                "data.json".to_string()
            } else {
                format!("{dir}/data.json")
            };
            if candidate != path {
                candidates.push(candidate);
            }
            if dir == "." {
                break;
            }
            dir = dirname(&dir);
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let dialect = self.dialect;
        let mut args = vec![SqlValue::Int(source_id)];
        let placeholders: Vec<String> = candidates
            .iter()
            .map(|candidate| {
                args.push(SqlValue::Str(candidate.clone()));
                dialect.placeholder(args.len())
            })
            .collect();
        let sql = format!(
            "SELECT path, data FROM sources_data WHERE source_id = {} AND path IN ({})",
            dialect.placeholder(1),
            placeholders.join(", ")
        );
        let rows = bind_all(sqlx::query(&sql), args).fetch_all(&mut **tx).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut tree = Value::Null;
        let mut involved = Vec::new();
        for row in &rows {
            let row_path = row.get::<String, _>(0);
            let doc = decode_data(&row_path, &row.get::<String, _>(1))?;
            let dir = dir_segments(&row_path);
            involved.push(row_path.clone());
            insert_at(&mut tree, &dir, doc).map_err(|_| StoreError::DataConflict {
                paths: involved.clone(),
            })?;
        }
        let dir = dir_segments(path);
        insert_at(&mut tree, &dir, value.clone()).map_err(|_| StoreError::DataConflict {
            paths: involved,
        })?;
        Ok(())
    }
}

fn dir_segments(path: &str) -> Vec<&str> {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    }
}

fn checked_path(path: &str) -> Result<String, StoreError> {
    let normalized = normalize(path);
    if normalized == "."
        || normalized.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StoreError::Validation(format!("invalid data path {path:?}")));
    }
    Ok(normalized)
}

fn decode_data(path: &str, encoded: &str) -> Result<Value, StoreError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Validation(format!("data row {path:?}: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Escape LIKE wildcards with `!`, the portable escape character.
fn escape_like(s: &str) -> String {
    s.replace('!', "!!").replace('%', "!%").replace('_', "!_")
}

/// One JSON Patch operation; only add, remove and replace are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), String> {
    for op in ops {
        let tokens = parse_pointer(&op.path)?;
        match op.op.as_str() {
            "add" => pointer_add(doc, &tokens, op.value.clone())?,
            "replace" => pointer_replace(doc, &tokens, op.value.clone())?,
            "remove" => pointer_remove(doc, &tokens)?,
            other => return Err(format!("unsupported patch op {other:?}")),
        }
    }
    Ok(())
}

fn parse_pointer(path: &str) -> Result<Vec<String>, String> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| format!("patch path {path:?} must start with '/'"))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn descend<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, String> {
    let mut node = doc;
    for token in tokens {
        node = match node {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| format!("patch path segment {token:?} not found"))?,
            Value::Array(items) => {
                let idx: usize = token
                    .parse()
                    .map_err(|_| format!("invalid array index {token:?}"))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| format!("array index {idx} out of bounds"))?
            }
            _ => return Err(format!("patch path segment {token:?} not traversable")),
        };
    }
    Ok(node)
}

fn split_last(tokens: &[String]) -> Result<(&[String], &String), String> {
    match tokens.split_last() {
        Some((last, parents)) => Ok((parents, last)),
        None => Err("patch path must not address the document root".to_string()),
    }
}

fn pointer_add(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), String> {
    let (parents, last) = split_last(tokens)?;
    match descend(doc, parents)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let idx: usize = last
                .parse()
                .map_err(|_| format!("invalid array index {last:?}"))?;
            if idx > items.len() {
                return Err(format!("array index {idx} out of bounds"));
            }
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(format!("cannot add under non-container at {last:?}")),
    }
}

fn pointer_replace(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), String> {
    let target = descend(doc, tokens)?;
    *target = value;
    Ok(())
}

fn pointer_remove(doc: &mut Value, tokens: &[String]) -> Result<(), String> {
    let (parents, last) = split_last(tokens)?;
    match descend(doc, parents)? {
        Value::Object(map) => map
            .remove(last)
            .map(|_| ())
            .ok_or_else(|| format!("patch path segment {last:?} not found")),
        Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| format!("invalid array index {last:?}"))?;
            if idx >= items.len() {
                return Err(format!("array index {idx} out of bounds"));
            }
            items.remove(idx);
            Ok(())
        }
        _ => Err(format!("cannot remove from non-container at {last:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_patch_ops() {
        let mut doc = json!({"a": {"b": 1}, "list": [1, 2]});
        apply_patch(
            &mut doc,
            &[
                PatchOp {
                    op: "add".to_string(),
                    path: "/a/c".to_string(),
                    value: json!(2),
                },
                PatchOp {
                    op: "replace".to_string(),
                    path: "/a/b".to_string(),
                    value: json!(9),
                },
                PatchOp {
                    op: "remove".to_string(),
                    path: "/list/0".to_string(),
                    value: Value::Null,
                },
                PatchOp {
                    op: "add".to_string(),
                    path: "/list/-".to_string(),
                    value: json!(3),
                },
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"a": {"b": 9, "c": 2}, "list": [2, 3]}));
    }

    #[test]
    fn test_unsupported_op_is_rejected() {
        let mut doc = json!({});
        let err = apply_patch(
            &mut doc,
            &[PatchOp {
                op: "move".to_string(),
                path: "/a".to_string(),
                value: Value::Null,
            }],
        )
        .unwrap_err();
        assert!(err.contains("unsupported patch op"));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a%b_c!d"), "a!%b!_c!!d");
    }

    #[test]
    fn test_checked_path() {
        assert_eq!(checked_path("a/b/data.json").unwrap(), "a/b/data.json");
        assert!(checked_path("../etc").is_err());
        assert!(checked_path("").is_err());
    }
}
