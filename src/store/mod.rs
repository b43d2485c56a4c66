//! # Relational Store
//!
//! Ownership-checked CRUD over bundles, sources, stacks, secrets, tokens and
//! principals. Every public operation receives a [`Caller`] and runs inside
//! a serializable transaction; list and get queries carry the authorization
//! compiler's SQL fragment so the database only returns rows the caller may
//! see.
//!
//! Upsert policy: an existing `(tenant, name)` row requires
//! `<resource>.manage`; a fresh insert requires `<resource>.create` and
//! grants the creating principal the owner role on that name in
//! `resource_permissions`.

use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::{Any, AnyPool, Row, Transaction};
use thiserror::Error;

use crate::authz::{Access, Authorizer, AuthzError, ColumnMappings, ColumnRef, SqlValue};
use crate::config::{Bundle, Secret, Source, Stack, Token};
use crate::migrations::Dialect;

mod cursor;
mod data;

pub use cursor::{decode_cursor, encode_cursor};
pub use data::{apply_patch, PatchOp};

type Tx = Transaction<'static, Any>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("data conflict: {paths:?}")]
    DataConflict { paths: Vec<String> },
    #[error("source {source_name:?} is still required by {requirer:?}")]
    ReferencedSource { source_name: String, requirer: String },
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The authenticated principal an operation runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub principal: String,
    pub tenant: String,
}

impl Caller {
    pub fn new(principal: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            tenant: tenant.into(),
        }
    }

    /// The in-process principal used by config loading and bundle workers.
    pub fn internal(tenant: impl Into<String>) -> Self {
        Self::new("internal", tenant)
    }
}

/// A principal row: an identity with a tenant-wide role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: String,
    pub tenant: String,
}

/// Per-bundle build status reported by the worker.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BundleStatus {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
    authz: Authorizer,
}

impl Store {
    pub async fn connect(url: &str, dialect: Dialect) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let mut options = AnyPoolOptions::new();
        // SQLite serializes writers anyway, and in-memory databases exist
        // per connection.
        if dialect == Dialect::Sqlite {
            options = options.max_connections(1);
        }
        let pool = options.connect(url).await?;
        Ok(Self::new(pool, dialect))
    }

    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self {
            pool,
            dialect,
            authz: Authorizer::new(),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn begin(&self) -> Result<Tx, StoreError> {
        let mut tx = self.pool.begin().await?;
        // SQLite transactions are serializable by construction and
        // CockroachDB only offers SERIALIZABLE. MySQL cannot change the
        // level once a transaction is open, so it keeps the session default.
        if self.dialect == Dialect::Postgres {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    // ---- authorization helpers -------------------------------------------

    /// Check a write permission for a known resource name. The fragment is
    /// closed (no outer-table references), so it can be probed standalone.
    async fn authorized(
        &self,
        tx: &mut Tx,
        caller: &Caller,
        resource: &str,
        verb: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let access = Access {
            principal: caller.principal.clone(),
            tenant: caller.tenant.clone(),
            resource: resource.to_string(),
            permission: format!("{resource}.{verb}"),
            name: Some(name.to_string()),
        };
        let expr = self.authz.partial(&access, &ColumnMappings::new())?;
        if expr.is_true() {
            return Ok(true);
        }
        if expr.is_false() {
            return Ok(false);
        }
        let mut args = Vec::new();
        let dialect = self.dialect;
        let frag = expr.sql(&|i| dialect.placeholder(i), &mut args);
        let sql = format!("SELECT 1 FROM tenants WHERE {frag} LIMIT 1");
        let row = bind_all(sqlx::query(&sql), args)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.is_some())
    }

    async fn require_write(
        &self,
        tx: &mut Tx,
        caller: &Caller,
        resource: &str,
        name: &str,
        exists: bool,
    ) -> Result<(), StoreError> {
        let verb = if exists { "manage" } else { "create" };
        if self.authorized(tx, caller, resource, verb, name).await? {
            Ok(())
        } else {
            Err(StoreError::NotAuthorized)
        }
    }

    /// Record the creating principal as owner of a fresh resource name.
    async fn grant_owner(
        &self,
        tx: &mut Tx,
        caller: &Caller,
        resource: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let p = |i| self.dialect.placeholder(i);
        let cols = "tenant_id, principal_id, resource, name, role";
        let values = format!(
            "(SELECT id FROM tenants WHERE name = {}), {}, {}, {}, 'owner'",
            p(1),
            p(2),
            p(3),
            p(4)
        );
        let sql = match self.dialect {
            Dialect::Sqlite => format!(
                "INSERT OR REPLACE INTO resource_permissions ({cols}) VALUES ({values})"
            ),
            Dialect::Postgres | Dialect::Cockroach => format!(
                "INSERT INTO resource_permissions ({cols}) VALUES ({values}) \
                 ON CONFLICT (tenant_id, principal_id, resource, name) DO UPDATE SET role = 'owner'"
            ),
            Dialect::Mysql => format!(
                "INSERT INTO resource_permissions ({cols}) VALUES ({values}) \
                 ON DUPLICATE KEY UPDATE role = 'owner'"
            ),
        };
        sqlx::query(&sql)
            .bind(&caller.tenant)
            .bind(&caller.principal)
            .bind(resource)
            .bind(name)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---- generic row plumbing --------------------------------------------

    async fn find_id(
        &self,
        tx: &mut Tx,
        table: &str,
        tenant: &str,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT {table}.id FROM {table} JOIN tenants ON {table}.tenant_id = tenants.id \
             WHERE tenants.name = {} AND {table}.name = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(tenant)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)))
    }

    /// Dialect-specific upsert keyed on `(tenant_id, name)`, returning the
    /// row id. MySQL cannot return it from the upsert, so a secondary SELECT
    /// runs in the same transaction. SQLite's `INSERT OR REPLACE` deletes
    /// the old row, so the existing id is carried into the replacement to
    /// keep referencing rows valid.
    async fn upsert_row(
        &self,
        tx: &mut Tx,
        table: &str,
        tenant: &str,
        name: &str,
        existing: Option<i64>,
        extra: &[(&str, SqlValue)],
    ) -> Result<i64, StoreError> {
        let p = |i| self.dialect.placeholder(i);
        let mut cols = Vec::new();
        let mut values = Vec::new();
        let mut arg_offset = 1;
        if self.dialect == Dialect::Sqlite {
            if let Some(id) = existing {
                cols.push("id".to_string());
                values.push(id.to_string());
            }
        }
        cols.extend(["tenant_id".to_string(), "name".to_string()]);
        values.push(format!("(SELECT id FROM tenants WHERE name = {})", p(arg_offset)));
        arg_offset += 1;
        values.push(p(arg_offset));
        for (col, _) in extra {
            arg_offset += 1;
            cols.push((*col).to_string());
            values.push(p(arg_offset));
        }
        let cols = cols.join(", ");
        let values = values.join(", ");

        let sql = match self.dialect {
            Dialect::Sqlite => format!(
                "INSERT OR REPLACE INTO {table} ({cols}) VALUES ({values}) RETURNING id"
            ),
            Dialect::Postgres | Dialect::Cockroach => {
                let updates: Vec<String> = extra
                    .iter()
                    .map(|(col, _)| format!("{col} = EXCLUDED.{col}"))
                    .collect();
                format!(
                    "INSERT INTO {table} ({cols}) VALUES ({values}) \
                     ON CONFLICT (tenant_id, name) DO UPDATE SET {} RETURNING id",
                    updates.join(", ")
                )
            }
            Dialect::Mysql => {
                let updates: Vec<String> = extra
                    .iter()
                    .map(|(col, _)| format!("{col} = VALUES({col})"))
                    .collect();
                format!(
                    "INSERT INTO {table} ({cols}) VALUES ({values}) \
                     ON DUPLICATE KEY UPDATE {}",
                    updates.join(", ")
                )
            }
        };

        let mut query = sqlx::query(&sql).bind(tenant).bind(name);
        for (_, value) in extra {
            query = bind_one(query, value.clone());
        }

        if self.dialect.supports_returning() {
            let row = query.fetch_one(&mut **tx).await?;
            Ok(row.get::<i64, _>(0))
        } else {
            query.execute(&mut **tx).await?;
            self.find_id(tx, table, tenant, name)
                .await?
                .ok_or(StoreError::NotFound)
        }
    }

    /// Authorization-scoped select over an entity table. Returns
    /// `(id, config)` rows ordered by id.
    async fn select_configs(
        &self,
        tx: &mut Tx,
        caller: &Caller,
        table: &str,
        name: Option<&str>,
        opts: &ListOptions,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        let access = Access {
            principal: caller.principal.clone(),
            tenant: caller.tenant.clone(),
            resource: table.to_string(),
            permission: format!("{table}.view"),
            name: None,
        };
        let mappings = ColumnMappings::from([(
            "input.name".to_string(),
            ColumnRef::new(table, "name"),
        )]);
        let expr = self.authz.partial(&access, &mappings)?;
        if expr.is_false() {
            return Ok(Vec::new());
        }

        let mut args = vec![SqlValue::Str(caller.tenant.clone())];
        let dialect = self.dialect;
        let frag = {
            // Placeholder indices continue after the tenant argument.
            let args_ref = &mut args;
            expr.sql(&|i| dialect.placeholder(i), args_ref)
        };
        let mut sql = format!(
            "SELECT {table}.id, {table}.config FROM {table} \
             JOIN tenants ON {table}.tenant_id = tenants.id \
             WHERE tenants.name = {} AND ({frag})",
            dialect.placeholder(1)
        );
        if let Some(name) = name {
            args.push(SqlValue::Str(name.to_string()));
            sql.push_str(&format!(" AND {table}.name = {}", dialect.placeholder(args.len())));
        }
        if let Some(cursor) = &opts.cursor {
            let last_id = decode_cursor(cursor).map_err(StoreError::Validation)?;
            args.push(SqlValue::Int(last_id));
            sql.push_str(&format!(" AND {table}.id > {}", dialect.placeholder(args.len())));
        }
        let limit = opts.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000);
        sql.push_str(&format!(" ORDER BY {table}.id LIMIT {limit}"));

        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&mut **tx)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    fn page<T: serde::de::DeserializeOwned>(
        &self,
        rows: Vec<(i64, String)>,
        opts: &ListOptions,
    ) -> Result<Page<T>, StoreError> {
        let limit = opts.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000);
        let next_cursor = if rows.len() as i64 == limit {
            rows.last().map(|(id, _)| encode_cursor(*id))
        } else {
            None
        };
        let items = rows
            .into_iter()
            .map(|(_, config)| serde_json::from_str(&config))
            .collect::<Result<Vec<T>, _>>()?;
        Ok(Page { items, next_cursor })
    }

    // ---- bundles ---------------------------------------------------------

    pub async fn upsert_bundle(&self, caller: &Caller, bundle: &Bundle) -> Result<(), StoreError> {
        if bundle.name.is_empty() {
            return Err(StoreError::Validation("bundle name is empty".to_string()));
        }
        let mut bundle = bundle.clone();
        bundle.tenant = caller.tenant.clone();

        let mut tx = self.begin().await?;
        let existing = self
            .find_id(&mut tx, "bundles", &caller.tenant, &bundle.name)
            .await?;
        self.require_write(&mut tx, caller, "bundles", &bundle.name, existing.is_some())
            .await?;

        let config = serde_json::to_string(&bundle)?;
        let id = self
            .upsert_row(
                &mut tx,
                "bundles",
                &caller.tenant,
                &bundle.name,
                existing,
                &[("config", SqlValue::Str(config))],
            )
            .await?;
        if existing.is_none() {
            self.grant_owner(&mut tx, caller, "bundles", &bundle.name)
                .await?;
        }

        self.replace_requirements(
            &mut tx,
            "bundles_requirements",
            "bundle_id",
            id,
            &caller.tenant,
            &bundle.requirements,
        )
        .await?;
        self.replace_secret_refs(
            &mut tx,
            "bundles_secrets",
            "bundle_id",
            id,
            &caller.tenant,
            bundle.object_storage.credentials().into_iter().collect(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_bundle(&self, caller: &Caller, name: &str) -> Result<Bundle, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self
            .select_configs(&mut tx, caller, "bundles", Some(name), &ListOptions::default())
            .await?;
        tx.commit().await?;
        let (_, config) = rows.into_iter().next().ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&config)?)
    }

    pub async fn list_bundles(
        &self,
        caller: &Caller,
        opts: &ListOptions,
    ) -> Result<Page<Bundle>, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self
            .select_configs(&mut tx, caller, "bundles", None, opts)
            .await?;
        tx.commit().await?;
        self.page(rows, opts)
    }

    pub async fn delete_bundle(&self, caller: &Caller, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "bundles", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let id = self
            .find_id(&mut tx, "bundles", &caller.tenant, name)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.delete_children(&mut tx, &["bundles_requirements", "bundles_secrets"], "bundle_id", id)
            .await?;
        self.delete_row(&mut tx, "bundles", id).await?;
        self.delete_permissions(&mut tx, &caller.tenant, "bundles", name)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_bundle_status(
        &self,
        caller: &Caller,
        name: &str,
        status: &BundleStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "bundles", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let id = self
            .find_id(&mut tx, "bundles", &caller.tenant, name)
            .await?
            .ok_or(StoreError::NotFound)?;
        let sql = format!(
            "UPDATE bundles SET status = {} WHERE id = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        sqlx::query(&sql)
            .bind(serde_json::to_string(status)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_bundle_status(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<Option<BundleStatus>, StoreError> {
        // Visibility piggybacks on the bundle read.
        self.get_bundle(caller, name).await?;
        let mut tx = self.begin().await?;
        let sql = format!(
            "SELECT bundles.status FROM bundles JOIN tenants ON bundles.tenant_id = tenants.id \
             WHERE tenants.name = {} AND bundles.name = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(&caller.tenant)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        let status: Option<String> = row.and_then(|r| r.get::<Option<String>, _>(0));
        Ok(match status {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    // ---- sources ---------------------------------------------------------

    pub async fn upsert_source(&self, caller: &Caller, source: &Source) -> Result<(), StoreError> {
        if source.name.is_empty() {
            return Err(StoreError::Validation("source name is empty".to_string()));
        }
        let mut source = source.clone();
        source.tenant = caller.tenant.clone();

        let mut tx = self.begin().await?;
        let existing = self
            .find_id(&mut tx, "sources", &caller.tenant, &source.name)
            .await?;
        self.require_write(&mut tx, caller, "sources", &source.name, existing.is_some())
            .await?;

        let config = serde_json::to_string(&source)?;
        let id = self
            .upsert_row(
                &mut tx,
                "sources",
                &caller.tenant,
                &source.name,
                existing,
                &[
                    ("builtin", SqlValue::Bool(source.builtin)),
                    ("config", SqlValue::Str(config)),
                ],
            )
            .await?;
        if existing.is_none() {
            self.grant_owner(&mut tx, caller, "sources", &source.name)
                .await?;
        }

        // Source-to-source requirements may reference sources that do not
        // exist yet; they are stored by name and resolved at build time.
        self.delete_children(&mut tx, &["sources_requirements", "datasources", "sources_secrets"], "source_id", id)
            .await?;
        let mut seen = std::collections::BTreeSet::new();
        for req in &source.requirements {
            let Some(req_name) = &req.source else {
                continue;
            };
            if !seen.insert(req_name.clone()) {
                continue;
            }
            let sql = format!(
                "INSERT INTO sources_requirements (source_id, requirement, git_commit, path, prefix) \
                 VALUES ({}, {}, {}, {}, {})",
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3),
                self.dialect.placeholder(4),
                self.dialect.placeholder(5)
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(req_name)
                .bind(req.git.as_ref().and_then(|g| g.commit.clone()))
                .bind(req.path.clone())
                .bind(req.prefix.clone())
                .execute(&mut *tx)
                .await?;
        }
        for ds in &source.datasources {
            let secret_id = match &ds.credentials {
                Some(secret) => self.find_id(&mut tx, "secrets", &caller.tenant, secret).await?,
                None => None,
            };
            let sql = format!(
                "INSERT INTO datasources (source_id, name, type, path, url, transform_query, config, secret_id) \
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {})",
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3),
                self.dialect.placeholder(4),
                self.dialect.placeholder(5),
                self.dialect.placeholder(6),
                self.dialect.placeholder(7),
                self.dialect.placeholder(8)
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(&ds.name)
                .bind(&ds.kind)
                .bind(&ds.path)
                .bind(ds.url.clone())
                .bind(ds.transform_query.clone())
                .bind(serde_json::to_string(&ds.config)?)
                .bind(secret_id)
                .execute(&mut *tx)
                .await?;
        }
        let mut secret_refs: Vec<&str> = Vec::new();
        if let Some(git) = &source.git {
            secret_refs.extend(git.credentials.as_deref());
        }
        secret_refs.extend(source.datasources.iter().filter_map(|d| d.credentials.as_deref()));
        self.replace_secret_refs(&mut tx, "sources_secrets", "source_id", id, &caller.tenant, secret_refs)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_source(&self, caller: &Caller, name: &str) -> Result<Source, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self
            .select_configs(&mut tx, caller, "sources", Some(name), &ListOptions::default())
            .await?;
        tx.commit().await?;
        let (_, config) = rows.into_iter().next().ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&config)?)
    }

    pub async fn list_sources(
        &self,
        caller: &Caller,
        opts: &ListOptions,
    ) -> Result<Page<Source>, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self
            .select_configs(&mut tx, caller, "sources", None, opts)
            .await?;
        tx.commit().await?;
        self.page(rows, opts)
    }

    /// Delete a source and the rows it owns. Requirement rows held by
    /// bundles and stacks are not cascaded: a source that is still required
    /// cannot be deleted.
    pub async fn delete_source(&self, caller: &Caller, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "sources", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let id = self
            .find_id(&mut tx, "sources", &caller.tenant, name)
            .await?
            .ok_or(StoreError::NotFound)?;

        for (table, parent, parent_col) in [
            ("bundles_requirements", "bundles", "bundle_id"),
            ("stacks_requirements", "stacks", "stack_id"),
        ] {
            let sql = format!(
                "SELECT {parent}.name FROM {table} JOIN {parent} ON {parent}.id = {table}.{parent_col} \
                 WHERE {table}.source_id = {} LIMIT 1",
                self.dialect.placeholder(1)
            );
            if let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await? {
                return Err(StoreError::ReferencedSource {
                    source_name: name.to_string(),
                    requirer: row.get::<String, _>(0),
                });
            }
        }

        self.delete_children(
            &mut tx,
            &["sources_requirements", "datasources", "sources_secrets", "sources_data"],
            "source_id",
            id,
        )
        .await?;
        self.delete_row(&mut tx, "sources", id).await?;
        self.delete_permissions(&mut tx, &caller.tenant, "sources", name)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- stacks ----------------------------------------------------------

    pub async fn upsert_stack(&self, caller: &Caller, stack: &Stack) -> Result<(), StoreError> {
        if stack.name.is_empty() {
            return Err(StoreError::Validation("stack name is empty".to_string()));
        }
        let mut stack = stack.clone();
        stack.tenant = caller.tenant.clone();

        let mut tx = self.begin().await?;
        let existing = self
            .find_id(&mut tx, "stacks", &caller.tenant, &stack.name)
            .await?;
        self.require_write(&mut tx, caller, "stacks", &stack.name, existing.is_some())
            .await?;

        let config = serde_json::to_string(&stack)?;
        let id = self
            .upsert_row(
                &mut tx,
                "stacks",
                &caller.tenant,
                &stack.name,
                existing,
                &[("config", SqlValue::Str(config))],
            )
            .await?;
        if existing.is_none() {
            self.grant_owner(&mut tx, caller, "stacks", &stack.name).await?;
        }
        self.replace_requirements(
            &mut tx,
            "stacks_requirements",
            "stack_id",
            id,
            &caller.tenant,
            &stack.requirements,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_stack(&self, caller: &Caller, name: &str) -> Result<Stack, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self
            .select_configs(&mut tx, caller, "stacks", Some(name), &ListOptions::default())
            .await?;
        tx.commit().await?;
        let (_, config) = rows.into_iter().next().ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&config)?)
    }

    pub async fn list_stacks(
        &self,
        caller: &Caller,
        opts: &ListOptions,
    ) -> Result<Page<Stack>, StoreError> {
        let mut tx = self.begin().await?;
        let rows = self.select_configs(&mut tx, caller, "stacks", None, opts).await?;
        tx.commit().await?;
        self.page(rows, opts)
    }

    pub async fn delete_stack(&self, caller: &Caller, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "stacks", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let id = self
            .find_id(&mut tx, "stacks", &caller.tenant, name)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.delete_children(&mut tx, &["stacks_requirements"], "stack_id", id)
            .await?;
        self.delete_row(&mut tx, "stacks", id).await?;
        self.delete_permissions(&mut tx, &caller.tenant, "stacks", name)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- secrets ---------------------------------------------------------

    pub async fn upsert_secret(&self, caller: &Caller, secret: &Secret) -> Result<(), StoreError> {
        if secret.name.is_empty() {
            return Err(StoreError::Validation("secret name is empty".to_string()));
        }
        let mut secret = secret.clone();
        secret.tenant = caller.tenant.clone();

        let mut tx = self.begin().await?;
        let existing = self
            .find_id(&mut tx, "secrets", &caller.tenant, &secret.name)
            .await?;
        self.require_write(&mut tx, caller, "secrets", &secret.name, existing.is_some())
            .await?;
        let value = serde_json::to_string(&secret.value)?;
        self.upsert_row(
            &mut tx,
            "secrets",
            &caller.tenant,
            &secret.name,
            existing,
            &[("value", SqlValue::Str(value))],
        )
        .await?;
        if existing.is_none() {
            self.grant_owner(&mut tx, caller, "secrets", &secret.name)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Full secret value; reserved for in-process resolution.
    pub async fn get_secret(&self, caller: &Caller, name: &str) -> Result<Secret, StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "secrets", "view", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let sql = format!(
            "SELECT secrets.value FROM secrets JOIN tenants ON secrets.tenant_id = tenants.id \
             WHERE tenants.name = {} AND secrets.name = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(&caller.tenant)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        tx.commit().await?;
        Ok(Secret {
            name: name.to_string(),
            tenant: caller.tenant.clone(),
            value: serde_json::from_str(&row.get::<String, _>(0))?,
        })
    }

    /// Secrets listing never discloses values, only names and types.
    pub async fn list_secrets(
        &self,
        caller: &Caller,
        opts: &ListOptions,
    ) -> Result<Page<Secret>, StoreError> {
        let mut tx = self.begin().await?;
        let access = Access {
            principal: caller.principal.clone(),
            tenant: caller.tenant.clone(),
            resource: "secrets".to_string(),
            permission: "secrets.view".to_string(),
            name: None,
        };
        let mappings = ColumnMappings::from([(
            "input.name".to_string(),
            ColumnRef::new("secrets", "name"),
        )]);
        let expr = self.authz.partial(&access, &mappings)?;
        if expr.is_false() {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        }
        let mut args = vec![SqlValue::Str(caller.tenant.clone())];
        let dialect = self.dialect;
        let frag = expr.sql(&|i| dialect.placeholder(i), &mut args);
        let mut sql = format!(
            "SELECT secrets.id, secrets.name, secrets.value FROM secrets \
             JOIN tenants ON secrets.tenant_id = tenants.id \
             WHERE tenants.name = {} AND ({frag})",
            dialect.placeholder(1)
        );
        if let Some(cursor) = &opts.cursor {
            let last_id = decode_cursor(cursor).map_err(StoreError::Validation)?;
            args.push(SqlValue::Int(last_id));
            sql.push_str(&format!(" AND secrets.id > {}", dialect.placeholder(args.len())));
        }
        let limit = opts.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000);
        sql.push_str(&format!(" ORDER BY secrets.id LIMIT {limit}"));

        let rows = bind_all(sqlx::query(&sql), args).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let next_cursor = if rows.len() as i64 == limit {
            rows.last().map(|r| encode_cursor(r.get::<i64, _>(0)))
        } else {
            None
        };
        let items = rows
            .iter()
            .map(|r| {
                let value: serde_json::Value = serde_json::from_str(&r.get::<String, _>(2))?;
                Ok(Secret {
                    name: r.get::<String, _>(1),
                    tenant: caller.tenant.clone(),
                    value: serde_json::json!({"type": value.get("type").cloned().unwrap_or_default()}),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Page { items, next_cursor })
    }

    pub async fn delete_secret(&self, caller: &Caller, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "secrets", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let id = self
            .find_id(&mut tx, "secrets", &caller.tenant, name)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.delete_row(&mut tx, "secrets", id).await?;
        self.delete_permissions(&mut tx, &caller.tenant, "secrets", name)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- tenants, principals, tokens -------------------------------------

    pub async fn upsert_tenant(&self, caller: &Caller, name: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "tenants", "manage", name).await? {
            return Err(StoreError::NotAuthorized);
        }
        let p1 = self.dialect.placeholder(1);
        let sql = match self.dialect {
            Dialect::Sqlite => format!("INSERT OR IGNORE INTO tenants (name) VALUES ({p1})"),
            Dialect::Postgres | Dialect::Cockroach => {
                format!("INSERT INTO tenants (name) VALUES ({p1}) ON CONFLICT (name) DO NOTHING")
            }
            Dialect::Mysql => format!("INSERT IGNORE INTO tenants (name) VALUES ({p1})"),
        };
        sqlx::query(&sql).bind(name).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_principal(
        &self,
        caller: &Caller,
        principal: &Principal,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self
            .authorized(&mut tx, caller, "principals", "manage", &principal.id)
            .await?
        {
            return Err(StoreError::NotAuthorized);
        }
        let p = |i| self.dialect.placeholder(i);
        let cols = "id, tenant_id, role";
        let values = format!(
            "{}, (SELECT id FROM tenants WHERE name = {}), {}",
            p(1),
            p(2),
            p(3)
        );
        let sql = match self.dialect {
            Dialect::Sqlite => {
                format!("INSERT OR REPLACE INTO principals ({cols}) VALUES ({values})")
            }
            Dialect::Postgres | Dialect::Cockroach => format!(
                "INSERT INTO principals ({cols}) VALUES ({values}) \
                 ON CONFLICT (id) DO UPDATE SET tenant_id = EXCLUDED.tenant_id, role = EXCLUDED.role"
            ),
            Dialect::Mysql => format!(
                "INSERT INTO principals ({cols}) VALUES ({values}) \
                 ON DUPLICATE KEY UPDATE tenant_id = VALUES(tenant_id), role = VALUES(role)"
            ),
        };
        sqlx::query(&sql)
            .bind(&principal.id)
            .bind(&principal.tenant)
            .bind(&principal.role)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_token(&self, caller: &Caller, token: &Token) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if !self
            .authorized(&mut tx, caller, "tokens", "manage", &token.name)
            .await?
        {
            return Err(StoreError::NotAuthorized);
        }
        let p = |i| self.dialect.placeholder(i);
        let cols = "tenant_id, name, api_key";
        let values = format!(
            "(SELECT id FROM tenants WHERE name = {}), {}, {}",
            p(1),
            p(2),
            p(3)
        );
        let sql = match self.dialect {
            Dialect::Sqlite => {
                format!("INSERT OR REPLACE INTO tokens ({cols}) VALUES ({values})")
            }
            Dialect::Postgres | Dialect::Cockroach => format!(
                "INSERT INTO tokens ({cols}) VALUES ({values}) \
                 ON CONFLICT (name) DO UPDATE SET tenant_id = EXCLUDED.tenant_id, api_key = EXCLUDED.api_key"
            ),
            Dialect::Mysql => format!(
                "INSERT INTO tokens ({cols}) VALUES ({values}) \
                 ON DUPLICATE KEY UPDATE tenant_id = VALUES(tenant_id), api_key = VALUES(api_key)"
            ),
        };
        sqlx::query(&sql)
            .bind(&caller.tenant)
            .bind(&token.name)
            .bind(&token.api_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Resolve a bearer token to its principal. Authentication, not
    /// authorization: no policy check applies here.
    pub async fn caller_by_api_key(&self, api_key: &str) -> Result<Option<Caller>, StoreError> {
        let sql = format!(
            "SELECT principals.id, tenants.name FROM tokens \
             JOIN principals ON principals.id = tokens.name \
             JOIN tenants ON tenants.id = principals.tenant_id \
             WHERE tokens.api_key = {}",
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Caller::new(r.get::<String, _>(0), r.get::<String, _>(1))))
    }

    /// All tenant names; used by the service reload loop.
    pub async fn list_tenants(&self, caller: &Caller) -> Result<Vec<String>, StoreError> {
        let mut tx = self.begin().await?;
        if !self.authorized(&mut tx, caller, "tenants", "view", "*").await? {
            return Err(StoreError::NotAuthorized);
        }
        let rows = sqlx::query("SELECT name FROM tenants ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    // ---- shared children plumbing ----------------------------------------

    async fn replace_requirements(
        &self,
        tx: &mut Tx,
        table: &str,
        parent_col: &str,
        parent_id: i64,
        tenant: &str,
        requirements: &[crate::config::Requirement],
    ) -> Result<(), StoreError> {
        self.delete_children(tx, &[table], parent_col, parent_id).await?;
        let mut seen = std::collections::BTreeSet::new();
        for req in requirements {
            let Some(source) = &req.source else {
                continue;
            };
            if !seen.insert(source.clone()) {
                continue;
            }
            let source_id = self
                .find_id(tx, "sources", tenant, source)
                .await?
                .ok_or_else(|| {
                    StoreError::Validation(format!("requirement references unknown source {source:?}"))
                })?;
            let sql = format!(
                "INSERT INTO {table} ({parent_col}, source_id, git_commit, path, prefix) \
                 VALUES ({}, {}, {}, {}, {})",
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3),
                self.dialect.placeholder(4),
                self.dialect.placeholder(5)
            );
            sqlx::query(&sql)
                .bind(parent_id)
                .bind(source_id)
                .bind(req.git.as_ref().and_then(|g| g.commit.clone()))
                .bind(req.path.clone())
                .bind(req.prefix.clone())
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn replace_secret_refs(
        &self,
        tx: &mut Tx,
        table: &str,
        parent_col: &str,
        parent_id: i64,
        tenant: &str,
        secrets: Vec<&str>,
    ) -> Result<(), StoreError> {
        self.delete_children(tx, &[table], parent_col, parent_id).await?;
        let mut seen = std::collections::BTreeSet::new();
        for secret in secrets {
            if !seen.insert(secret.to_string()) {
                continue;
            }
            let secret_id = self
                .find_id(tx, "secrets", tenant, secret)
                .await?
                .ok_or_else(|| {
                    StoreError::Validation(format!("reference to unknown secret {secret:?}"))
                })?;
            let sql = format!(
                "INSERT INTO {table} ({parent_col}, secret_id) VALUES ({}, {})",
                self.dialect.placeholder(1),
                self.dialect.placeholder(2)
            );
            sqlx::query(&sql)
                .bind(parent_id)
                .bind(secret_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn delete_children(
        &self,
        tx: &mut Tx,
        tables: &[&str],
        parent_col: &str,
        parent_id: i64,
    ) -> Result<(), StoreError> {
        for table in tables {
            let sql = format!(
                "DELETE FROM {table} WHERE {parent_col} = {}",
                self.dialect.placeholder(1)
            );
            sqlx::query(&sql).bind(parent_id).execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn delete_row(&self, tx: &mut Tx, table: &str, id: i64) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {table} WHERE id = {}", self.dialect.placeholder(1));
        sqlx::query(&sql).bind(id).execute(&mut **tx).await?;
        Ok(())
    }

    async fn delete_permissions(
        &self,
        tx: &mut Tx,
        tenant: &str,
        resource: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM resource_permissions \
             WHERE tenant_id = (SELECT id FROM tenants WHERE name = {}) \
             AND resource = {} AND name = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.placeholder(3)
        );
        sqlx::query(&sql)
            .bind(tenant)
            .bind(resource)
            .bind(name)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

fn bind_one(query: AnyQuery<'_>, value: SqlValue) -> AnyQuery<'_> {
    match value {
        SqlValue::Str(s) => query.bind(s),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Bool(b) => query.bind(b),
    }
}

fn bind_all(query: AnyQuery<'_>, values: Vec<SqlValue>) -> AnyQuery<'_> {
    values.into_iter().fold(query, bind_one)
}
