//! Datasource transforms.
//!
//! A transform rewrites one fetched document before the build: its query is
//! a dotted path selecting a subtree of the JSON content, and the selection
//! replaces the file in place. Transforms run entirely in-process, so no
//! network access is possible.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// File the transform applies to, relative to the source root.
    pub path: String,
    /// Dotted selection path, e.g. `.result.items`.
    pub query: String,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("query {query:?}: segment {segment:?} not found")]
    NotFound { query: String, segment: String },
    #[error("query {query:?}: invalid segment {segment:?}")]
    InvalidSegment { query: String, segment: String },
}

/// Apply `query` to `doc`, returning the selected subtree.
pub fn apply(query: &str, doc: &Value) -> Result<Value, TransformError> {
    let trimmed = query.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Ok(doc.clone());
    }
    let mut value = doc;
    for segment in trimmed.split('.') {
        if segment.is_empty() {
            return Err(TransformError::InvalidSegment {
                query: query.to_string(),
                segment: segment.to_string(),
            });
        }
        value = value
            .get(segment)
            .ok_or_else(|| TransformError::NotFound {
                query: query.to_string(),
                segment: segment.to_string(),
            })?;
    }
    Ok(value.clone())
}
