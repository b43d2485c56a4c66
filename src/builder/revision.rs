//! Revision expression evaluation.
//!
//! A bundle's revision is a small expression evaluated against the metadata
//! the synchronizers returned (`input.sources.<name>.<field>`) and the
//! process environment (`env.<VAR>`). Supported forms: a bare literal, a
//! dotted reference, or a double-quoted template with `${ref}` placeholders.
//! Only scalar results are allowed.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Per-source metadata emitted by the synchronizers.
pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("unknown reference {0:?} in revision expression")]
    UnknownRef(String),
    #[error("revision expression produced a non-scalar value for {0:?}")]
    NonScalar(String),
    #[error("unterminated placeholder in revision template {0:?}")]
    UnterminatedPlaceholder(String),
}

pub fn evaluate(
    expr: &str,
    sources: &BTreeMap<String, Metadata>,
    env: &BTreeMap<String, String>,
) -> Result<String, RevisionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(String::new());
    }
    if let Some(inner) = expr
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return expand_template(inner, sources, env);
    }
    if expr.parse::<f64>().is_ok() {
        return Ok(expr.to_string());
    }
    let value = resolve(expr, sources, env)?;
    stringify(expr, &value)
}

fn expand_template(
    template: &str,
    sources: &BTreeMap<String, Metadata>,
    env: &BTreeMap<String, String>,
) -> Result<String, RevisionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| RevisionError::UnterminatedPlaceholder(template.to_string()))?;
        let value = resolve(after[..end].trim(), sources, env)?;
        out.push_str(&stringify(&after[..end], &value)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(
    reference: &str,
    sources: &BTreeMap<String, Metadata>,
    env: &BTreeMap<String, String>,
) -> Result<Value, RevisionError> {
    let unknown = || RevisionError::UnknownRef(reference.to_string());

    if let Some(var) = reference
        .strip_prefix("opa.runtime().env.")
        .or_else(|| reference.strip_prefix("env."))
    {
        return env.get(var).cloned().map(Value::String).ok_or_else(unknown);
    }

    let path = reference
        .strip_prefix("input.sources.")
        .ok_or_else(unknown)?;
    let mut segments = path.split('.');
    let source = segments.next().ok_or_else(unknown)?;
    let mut value = Value::Object(
        sources
            .get(source)
            .ok_or_else(unknown)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    for segment in segments {
        value = value.get(segment).cloned().ok_or_else(unknown)?;
    }
    Ok(value)
}

fn stringify(reference: &str, value: &Value) -> Result<String, RevisionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(RevisionError::NonScalar(reference.to_string())),
    }
}
