//! Typed secret values and environment expansion.
//!
//! Secrets are stored as opaque JSON discriminated by `type`. String fields
//! may reference environment variables as `${VAR}`; expansion happens when a
//! secret is resolved for use, never when it is stored.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::Secret;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {name:?}: {message}")]
    Invalid { name: String, message: String },
    #[error("secret {name:?}: environment variable {var:?} is not set")]
    MissingEnv { name: String, var: String },
}

/// The supported secret shapes, discriminated by `value.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretValue {
    AwsAuth {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    AzureAuth {
        account_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
    },
    GcpAuth {
        credentials: String,
    },
    SshKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    TokenAuth {
        token: String,
    },
    OidcAuth {
        issuer_url: String,
        client_id: String,
        client_secret: String,
    },
    Password {
        password: String,
    },
    TlsCert {
        cert: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca_cert: Option<String>,
    },
}

impl SecretValue {
    /// The `type` discriminator string for this value.
    pub fn kind(&self) -> &'static str {
        match self {
            SecretValue::AwsAuth { .. } => "aws_auth",
            SecretValue::AzureAuth { .. } => "azure_auth",
            SecretValue::GcpAuth { .. } => "gcp_auth",
            SecretValue::SshKey { .. } => "ssh_key",
            SecretValue::BasicAuth { .. } => "basic_auth",
            SecretValue::TokenAuth { .. } => "token_auth",
            SecretValue::OidcAuth { .. } => "oidc_auth",
            SecretValue::Password { .. } => "password",
            SecretValue::TlsCert { .. } => "tls_cert",
        }
    }
}

static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(?P<var>[A-Za-z_][A-Za-z0-9_]*)\}").expect("env regex"));

impl Secret {
    /// Expand `${VAR}` references and parse the typed value.
    pub fn resolve(&self) -> Result<SecretValue, SecretError> {
        let expanded = expand_env(&self.name, &self.value)?;
        serde_json::from_value(expanded).map_err(|e| SecretError::Invalid {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Shape check without environment expansion, used at config load.
    pub fn validate(&self) -> Result<(), SecretError> {
        serde_json::from_value::<SecretValue>(self.value.clone()).map(|_| ()).map_err(|e| {
            SecretError::Invalid {
                name: self.name.clone(),
                message: e.to_string(),
            }
        })
    }
}

fn expand_env(name: &str, value: &Value) -> Result<Value, SecretError> {
    Ok(match value {
        Value::String(s) => Value::String(expand_env_str(name, s)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| expand_env(name, v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| expand_env(name, v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        ),
        other => other.clone(),
    })
}

fn expand_env_str(name: &str, s: &str) -> Result<String, SecretError> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in ENV_REF_RE.captures_iter(s) {
        let whole = caps.get(0).expect("capture 0 always present");
        let var = &caps["var"];
        out.push_str(&s[last..whole.start()]);
        let value = std::env::var(var).map_err(|_| SecretError::MissingEnv {
            name: name.to_string(),
            var: var.to_string(),
        })?;
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(value: Value) -> Secret {
        Secret {
            name: "s".to_string(),
            tenant: "default".to_string(),
            value,
        }
    }

    #[test]
    fn test_resolve_basic_auth() {
        let s = secret(json!({"type": "basic_auth", "username": "bob", "password": "pw"}));
        assert_eq!(
            s.resolve().unwrap(),
            SecretValue::BasicAuth {
                username: "bob".to_string(),
                password: "pw".to_string()
            }
        );
    }

    #[test]
    fn test_env_expansion_at_resolution() {
        std::env::set_var("BCP_TEST_TOKEN", "tok123");
        let s = secret(json!({"type": "token_auth", "token": "${BCP_TEST_TOKEN}"}));
        assert_eq!(
            s.resolve().unwrap(),
            SecretValue::TokenAuth {
                token: "tok123".to_string()
            }
        );
    }

    #[test]
    fn test_missing_env_is_an_error() {
        let s = secret(json!({"type": "password", "password": "${BCP_TEST_DEFINITELY_UNSET}"}));
        assert!(matches!(s.resolve(), Err(SecretError::MissingEnv { .. })));
    }

    #[test]
    fn test_unknown_type_is_invalid() {
        let s = secret(json!({"type": "carrier_pigeon"}));
        assert!(s.validate().is_err());
    }
}
