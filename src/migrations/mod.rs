//! # Migrations & Dialect Layer
//!
//! Ordered, versioned schema evolution generated lazily per dialect.
//! Version 1 installs the pre-tenancy schema; version 2 is the multi-tenancy
//! transition: every entity table gains an integer `id`, cross tables switch
//! to `(entity_id, other_id)` keys and uniqueness moves to
//! `(tenant_id, name)`. On CockroachDB the pre-tenancy schema is never
//! installed; version 2 creates the final schema directly.
//!
//! Each migration is applied in its own transaction: it either completes or
//! leaves the database unchanged.

use sqlx::AnyPool;
use thiserror::Error;
use tracing::info;

mod dialect;
pub mod schema;

pub use dialect::Dialect;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration {version} failed: {source}")]
    Failed {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema",
    },
    Migration {
        version: 2,
        description: "multi-tenancy",
    },
];

/// Generate the SQL for one migration version under one dialect.
pub fn statements(version: i64, dialect: Dialect) -> Vec<String> {
    match (version, dialect) {
        // CockroachDB fast-forwards: the pre-tenancy schema is skipped and
        // the v2 schema installed directly.
        (1, Dialect::Cockroach) => Vec::new(),
        (2, Dialect::Cockroach) => {
            let mut out: Vec<String> = schema::v2_tables("")
                .iter()
                .map(|t| t.create_sql(dialect, 2))
                .collect();
            out.push("INSERT INTO tenants (name) VALUES ('default')".to_string());
            out
        }
        (1, _) => schema::v1_tables()
            .iter()
            .map(|t| t.create_sql(dialect, 1))
            .collect(),
        (2, _) => multitenancy_transition(dialect),
        _ => Vec::new(),
    }
}

fn rename_sql(dialect: Dialect, from: &str, to: &str) -> String {
    match dialect {
        Dialect::Mysql => format!("RENAME TABLE {from} TO {to}"),
        _ => format!("ALTER TABLE {from} RENAME TO {to}"),
    }
}

fn multitenancy_transition(dialect: Dialect) -> Vec<String> {
    let mut out = Vec::new();

    for table in schema::v2_tables("_mt") {
        out.push(table.create_sql(dialect, 2));
    }
    out.push("INSERT INTO tenants (name) VALUES ('default')".to_string());

    // Copy parents first, then the rows that join against their new ids.
    out.extend(
        [
            "INSERT INTO principals_mt (id, tenant_id, role) \
             SELECT p.id, t.id, p.role FROM principals p, tenants t WHERE t.name = 'default'",
            "INSERT INTO tokens_mt (tenant_id, name, api_key) \
             SELECT t.id, k.name, k.api_key FROM tokens k, tenants t WHERE t.name = 'default'",
            "INSERT INTO secrets_mt (tenant_id, name, value) \
             SELECT t.id, s.name, s.value FROM secrets s, tenants t WHERE t.name = 'default'",
            "INSERT INTO bundles_mt (tenant_id, name, config, status) \
             SELECT t.id, b.name, b.config, b.status FROM bundles b, tenants t WHERE t.name = 'default'",
            "INSERT INTO sources_mt (tenant_id, name, builtin, config) \
             SELECT t.id, s.name, s.builtin, s.config FROM sources s, tenants t WHERE t.name = 'default'",
            "INSERT INTO stacks_mt (tenant_id, name, config) \
             SELECT t.id, s.name, s.config FROM stacks s, tenants t WHERE t.name = 'default'",
            "INSERT INTO resource_permissions_mt (tenant_id, principal_id, resource, name, role, permission) \
             SELECT t.id, rp.principal_id, rp.resource, rp.name, rp.role, rp.permission \
             FROM resource_permissions rp, tenants t WHERE t.name = 'default'",
            "INSERT INTO bundles_requirements_mt (bundle_id, source_id, git_commit, path, prefix) \
             SELECT b.id, s.id, r.git_commit, r.path, r.prefix FROM bundles_requirements r \
             JOIN bundles_mt b ON b.name = r.bundle_name \
             JOIN sources_mt s ON s.name = r.source_name",
            "INSERT INTO stacks_requirements_mt (stack_id, source_id, git_commit, path, prefix) \
             SELECT st.id, s.id, r.git_commit, r.path, r.prefix FROM stacks_requirements r \
             JOIN stacks_mt st ON st.name = r.stack_name \
             JOIN sources_mt s ON s.name = r.source_name",
            "INSERT INTO sources_requirements_mt (source_id, requirement, git_commit, path, prefix) \
             SELECT s.id, r.requirement, r.git_commit, r.path, r.prefix FROM sources_requirements r \
             JOIN sources_mt s ON s.name = r.source_name",
            "INSERT INTO bundles_secrets_mt (bundle_id, secret_id) \
             SELECT b.id, sec.id FROM bundles_secrets x \
             JOIN bundles_mt b ON b.name = x.bundle_name \
             JOIN secrets_mt sec ON sec.name = x.secret_name",
            "INSERT INTO sources_secrets_mt (source_id, secret_id) \
             SELECT s.id, sec.id FROM sources_secrets x \
             JOIN sources_mt s ON s.name = x.source_name \
             JOIN secrets_mt sec ON sec.name = x.secret_name",
            "INSERT INTO datasources_mt (source_id, name, type, path, url, transform_query, config, secret_id) \
             SELECT s.id, d.name, d.type, d.path, d.url, d.transform_query, d.config, sec.id \
             FROM datasources d \
             JOIN sources_mt s ON s.name = d.source_name \
             LEFT JOIN secrets_mt sec ON sec.name = d.secret_name",
            "INSERT INTO sources_data_mt (source_id, path, data) \
             SELECT s.id, d.path, d.data FROM sources_data d \
             JOIN sources_mt s ON s.name = d.source_name",
        ]
        .into_iter()
        .map(str::to_string),
    );

    // Drop the name-keyed tables, children before parents.
    for table in [
        "datasources",
        "sources_data",
        "sources_requirements",
        "bundles_requirements",
        "stacks_requirements",
        "bundles_secrets",
        "sources_secrets",
        "resource_permissions",
        "bundles",
        "sources",
        "stacks",
        "secrets",
        "tokens",
        "principals",
    ] {
        out.push(format!("DROP TABLE {table}"));
    }

    for table in [
        "principals",
        "tokens",
        "secrets",
        "bundles",
        "sources",
        "stacks",
        "resource_permissions",
        "bundles_requirements",
        "stacks_requirements",
        "sources_requirements",
        "bundles_secrets",
        "sources_secrets",
        "datasources",
        "sources_data",
    ] {
        out.push(rename_sql(dialect, &format!("{table}_mt"), table));
    }

    out
}

/// Applies pending migrations in version order.
pub struct Migrator {
    pool: AnyPool,
    dialect: Dialect,
}

impl Migrator {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Apply every pending migration. Each migration runs in a single
    /// transaction; on failure the database is left at the last applied
    /// version.
    pub async fn run(&self) -> Result<(), MigrateError> {
        self.ensure_version_table().await?;
        let applied = self.applied_versions().await?;

        for migration in MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            let mut tx = self.pool.begin().await?;
            for stmt in statements(migration.version, self.dialect) {
                sqlx::query(&stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| MigrateError::Failed {
                        version: migration.version,
                        source,
                    })?;
            }
            let insert = format!(
                "INSERT INTO schema_migrations (version) VALUES ({})",
                self.dialect.placeholder(1)
            );
            sqlx::query(&insert)
                .bind(migration.version)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrateError::Failed {
                    version: migration.version,
                    source,
                })?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Report outstanding migration versions without applying them.
    pub async fn dry_run(&self) -> Result<Vec<i64>, MigrateError> {
        self.ensure_version_table().await?;
        let applied = self.applied_versions().await?;
        Ok(MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| !applied.contains(v))
            .collect())
    }

    async fn ensure_version_table(&self) -> Result<(), MigrateError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_migrations (version BIGINT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>, MigrateError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cockroach_fast_forward() {
        assert!(statements(1, Dialect::Cockroach).is_empty());
        let v2 = statements(2, Dialect::Cockroach);
        assert!(v2.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS bundles ")));
        assert!(v2.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS tokens ")));
        assert!(!v2.iter().any(|s| s.contains("_mt")));
    }

    #[test]
    fn test_transition_renames_everything() {
        let v2 = statements(2, Dialect::Sqlite);
        assert!(v2.iter().any(|s| s == "ALTER TABLE bundles_mt RENAME TO bundles"));
        assert!(v2.iter().any(|s| s == "ALTER TABLE tokens_mt RENAME TO tokens"));
        assert!(v2.iter().any(|s| s.starts_with("DROP TABLE bundles")));
        assert!(v2.iter().any(|s| s == "DROP TABLE tokens"));
        let v2_mysql = statements(2, Dialect::Mysql);
        assert!(v2_mysql.iter().any(|s| s == "RENAME TABLE bundles_mt TO bundles"));
    }
}
