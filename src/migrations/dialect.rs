//! SQL dialect enumeration and parameter rendering.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
    Cockroach,
}

impl Dialect {
    /// Infer the dialect from a database URL scheme. CockroachDB speaks the
    /// PostgreSQL wire protocol, so it can only be selected explicitly via
    /// the config `dialect` field.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?;
        match scheme {
            "sqlite" => Some(Dialect::Sqlite),
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "mysql" | "mariadb" => Some(Dialect::Mysql),
            _ => None,
        }
    }

    /// Render the 1-based `i`-th bind parameter.
    pub fn placeholder(self, i: usize) -> String {
        match self {
            Dialect::Postgres | Dialect::Cockroach => format!("${i}"),
            Dialect::Sqlite | Dialect::Mysql => "?".to_string(),
        }
    }

    /// Whether `INSERT … RETURNING id` is available; MySQL needs a secondary
    /// SELECT instead.
    pub fn supports_returning(self) -> bool {
        !matches!(self, Dialect::Mysql)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Cockroach => "cockroach",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "cockroach" | "cockroachdb" => Ok(Dialect::Cockroach),
            other => Err(format!("unknown database dialect {other:?}")),
        }
    }
}
