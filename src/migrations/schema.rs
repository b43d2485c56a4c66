//! Typed table builder and the schema definitions.
//!
//! DDL is assembled from table descriptions so each dialect renders its own
//! column types and auto-increment forms. Constraint names are deterministic
//! (`<iteration>_<table>_<cols>_<kind>`) so later migrations can target them
//! by name.

use super::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Text,
    BigInt,
    Bool,
    /// Dialect-specific auto-increment integer primary key.
    Serial,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColType,
    pub not_null: bool,
}

#[derive(Debug, Clone)]
pub enum Constraint {
    PrimaryKey {
        cols: Vec<String>,
    },
    Unique {
        cols: Vec<String>,
    },
    ForeignKey {
        cols: Vec<String>,
        ref_table: String,
        ref_cols: Vec<String>,
        cascade: bool,
    },
}

impl Constraint {
    fn kind(&self) -> &'static str {
        match self {
            Constraint::PrimaryKey { .. } => "pk",
            Constraint::Unique { .. } => "uq",
            Constraint::ForeignKey { .. } => "fk",
        }
    }

    fn cols(&self) -> &[String] {
        match self {
            Constraint::PrimaryKey { cols }
            | Constraint::Unique { cols }
            | Constraint::ForeignKey { cols, .. } => cols,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub constraints: Vec<Constraint>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn serial_id(self) -> Self {
        self.column("id", ColType::Serial, true)
    }

    pub fn column(mut self, name: &str, ty: ColType, not_null: bool) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            ty,
            not_null,
        });
        self
    }

    pub fn text(self, name: &str) -> Self {
        self.column(name, ColType::Text, true)
    }

    pub fn text_null(self, name: &str) -> Self {
        self.column(name, ColType::Text, false)
    }

    pub fn primary_key(mut self, cols: &[&str]) -> Self {
        self.constraints.push(Constraint::PrimaryKey {
            cols: cols.iter().map(|c| (*c).to_string()).collect(),
        });
        self
    }

    pub fn unique(mut self, cols: &[&str]) -> Self {
        self.constraints.push(Constraint::Unique {
            cols: cols.iter().map(|c| (*c).to_string()).collect(),
        });
        self
    }

    pub fn foreign_key(mut self, cols: &[&str], ref_table: &str, ref_cols: &[&str]) -> Self {
        self.constraints.push(Constraint::ForeignKey {
            cols: cols.iter().map(|c| (*c).to_string()).collect(),
            ref_table: ref_table.to_string(),
            ref_cols: ref_cols.iter().map(|c| (*c).to_string()).collect(),
            cascade: false,
        });
        self
    }

    pub fn foreign_key_cascade(
        mut self,
        cols: &[&str],
        ref_table: &str,
        ref_cols: &[&str],
    ) -> Self {
        self.constraints.push(Constraint::ForeignKey {
            cols: cols.iter().map(|c| (*c).to_string()).collect(),
            ref_table: ref_table.to_string(),
            ref_cols: ref_cols.iter().map(|c| (*c).to_string()).collect(),
            cascade: true,
        });
        self
    }

    /// Render `CREATE TABLE`. `iteration` is the migration version the table
    /// was introduced in; it prefixes every constraint name.
    pub fn create_sql(&self, dialect: Dialect, iteration: u32) -> String {
        let mut parts: Vec<String> = Vec::new();
        let has_serial = self.columns.iter().any(|c| c.ty == ColType::Serial);

        for col in &self.columns {
            parts.push(render_column(col, dialect));
        }

        for constraint in &self.constraints {
            // SQLite's AUTOINCREMENT requires the inline `INTEGER PRIMARY
            // KEY` form, so the named PK constraint is dropped there.
            if dialect == Dialect::Sqlite
                && has_serial
                && matches!(constraint, Constraint::PrimaryKey { .. })
            {
                continue;
            }
            parts.push(render_constraint(&self.name, constraint, iteration));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }
}

fn render_column(col: &Column, dialect: Dialect) -> String {
    let ty = match (col.ty, dialect) {
        (ColType::Serial, Dialect::Sqlite) => {
            return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", col.name);
        }
        (ColType::Serial, Dialect::Postgres) => "BIGSERIAL".to_string(),
        (ColType::Serial, Dialect::Mysql) => "BIGINT NOT NULL AUTO_INCREMENT".to_string(),
        (ColType::Serial, Dialect::Cockroach) => "SERIAL".to_string(),
        (ColType::Text, _) => "TEXT".to_string(),
        (ColType::BigInt, _) => "BIGINT".to_string(),
        (ColType::Bool, _) => "BOOLEAN".to_string(),
    };
    let mut out = format!("{} {ty}", col.name);
    if col.not_null && col.ty != ColType::Serial {
        out.push_str(" NOT NULL");
    }
    out
}

fn render_constraint(table: &str, constraint: &Constraint, iteration: u32) -> String {
    let name = format!(
        "{iteration}_{table}_{}_{}",
        constraint.cols().join("_"),
        constraint.kind()
    );
    match constraint {
        Constraint::PrimaryKey { cols } => {
            format!("CONSTRAINT {name} PRIMARY KEY ({})", cols.join(", "))
        }
        Constraint::Unique { cols } => {
            format!("CONSTRAINT {name} UNIQUE ({})", cols.join(", "))
        }
        Constraint::ForeignKey {
            cols,
            ref_table,
            ref_cols,
            cascade,
        } => {
            let mut out = format!(
                "CONSTRAINT {name} FOREIGN KEY ({}) REFERENCES {ref_table} ({})",
                cols.join(", "),
                ref_cols.join(", ")
            );
            if *cascade {
                out.push_str(" ON DELETE CASCADE");
            }
            out
        }
    }
}

/// The pre-tenancy schema: everything keyed by name, one implicit tenant.
pub fn v1_tables() -> Vec<Table> {
    vec![
        Table::new("principals")
            .text("id")
            .text("role")
            .primary_key(&["id"]),
        Table::new("resource_permissions")
            .text("principal_id")
            .text("resource")
            .text("name")
            .text_null("role")
            .text_null("permission")
            .primary_key(&["principal_id", "resource", "name"])
            .foreign_key_cascade(&["principal_id"], "principals", &["id"]),
        Table::new("tokens")
            .text("name")
            .text("api_key")
            .primary_key(&["name"])
            .unique(&["api_key"]),
        Table::new("secrets")
            .text("name")
            .text("value")
            .primary_key(&["name"]),
        Table::new("bundles")
            .text("name")
            .text("config")
            .text_null("status")
            .primary_key(&["name"]),
        Table::new("sources")
            .text("name")
            .column("builtin", ColType::Bool, true)
            .text("config")
            .primary_key(&["name"]),
        Table::new("stacks")
            .text("name")
            .text("config")
            .primary_key(&["name"]),
        Table::new("bundles_requirements")
            .text("bundle_name")
            .text("source_name")
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["bundle_name", "source_name"])
            .foreign_key_cascade(&["bundle_name"], "bundles", &["name"])
            .foreign_key(&["source_name"], "sources", &["name"]),
        Table::new("stacks_requirements")
            .text("stack_name")
            .text("source_name")
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["stack_name", "source_name"])
            .foreign_key_cascade(&["stack_name"], "stacks", &["name"])
            .foreign_key(&["source_name"], "sources", &["name"]),
        Table::new("sources_requirements")
            .text("source_name")
            .text("requirement")
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["source_name", "requirement"])
            .foreign_key_cascade(&["source_name"], "sources", &["name"]),
        Table::new("bundles_secrets")
            .text("bundle_name")
            .text("secret_name")
            .primary_key(&["bundle_name", "secret_name"])
            .foreign_key_cascade(&["bundle_name"], "bundles", &["name"])
            .foreign_key(&["secret_name"], "secrets", &["name"]),
        Table::new("sources_secrets")
            .text("source_name")
            .text("secret_name")
            .primary_key(&["source_name", "secret_name"])
            .foreign_key_cascade(&["source_name"], "sources", &["name"])
            .foreign_key(&["secret_name"], "secrets", &["name"]),
        Table::new("datasources")
            .text("source_name")
            .text("name")
            .text("type")
            .text("path")
            .text_null("url")
            .text_null("transform_query")
            .text_null("config")
            .text_null("secret_name")
            .primary_key(&["source_name", "name"])
            .foreign_key_cascade(&["source_name"], "sources", &["name"]),
        Table::new("sources_data")
            .text("source_name")
            .text("path")
            .text("data")
            .primary_key(&["source_name", "path"])
            .foreign_key_cascade(&["source_name"], "sources", &["name"]),
    ]
}

/// The multi-tenant schema. `suffix` is appended to every entity table name
/// (and to foreign-key references between them) so the tenancy transition
/// can build the new tables next to the old ones before the rename.
pub fn v2_tables(suffix: &str) -> Vec<Table> {
    let t = |name: &str| format!("{name}{suffix}");
    vec![
        Table::new("tenants")
            .serial_id()
            .text("name")
            .primary_key(&["id"])
            .unique(&["name"]),
        Table::new(t("principals"))
            .text("id")
            .column("tenant_id", ColType::BigInt, true)
            .text("role")
            .primary_key(&["id"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("resource_permissions"))
            .column("tenant_id", ColType::BigInt, true)
            .text("principal_id")
            .text("resource")
            .text("name")
            .text_null("role")
            .text_null("permission")
            .primary_key(&["tenant_id", "principal_id", "resource", "name"])
            .foreign_key_cascade(&["principal_id"], &t("principals"), &["id"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        // Tokens stay unique on name globally (they identify principals)
        // but gain an id and a tenant like every other entity table.
        Table::new(t("tokens"))
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .text("api_key")
            .primary_key(&["id"])
            .unique(&["name"])
            .unique(&["api_key"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("secrets"))
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .text("value")
            .primary_key(&["id"])
            .unique(&["tenant_id", "name"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("bundles"))
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .text("config")
            .text_null("status")
            .primary_key(&["id"])
            .unique(&["tenant_id", "name"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("sources"))
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .column("builtin", ColType::Bool, true)
            .text("config")
            .primary_key(&["id"])
            .unique(&["tenant_id", "name"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("stacks"))
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .text("config")
            .primary_key(&["id"])
            .unique(&["tenant_id", "name"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]),
        Table::new(t("bundles_requirements"))
            .column("bundle_id", ColType::BigInt, true)
            .column("source_id", ColType::BigInt, true)
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["bundle_id", "source_id"])
            .foreign_key_cascade(&["bundle_id"], &t("bundles"), &["id"])
            .foreign_key(&["source_id"], &t("sources"), &["id"]),
        Table::new(t("stacks_requirements"))
            .column("stack_id", ColType::BigInt, true)
            .column("source_id", ColType::BigInt, true)
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["stack_id", "source_id"])
            .foreign_key_cascade(&["stack_id"], &t("stacks"), &["id"])
            .foreign_key(&["source_id"], &t("sources"), &["id"]),
        Table::new(t("sources_requirements"))
            .column("source_id", ColType::BigInt, true)
            .text("requirement")
            .text_null("git_commit")
            .text_null("path")
            .text_null("prefix")
            .primary_key(&["source_id", "requirement"])
            .foreign_key_cascade(&["source_id"], &t("sources"), &["id"]),
        Table::new(t("bundles_secrets"))
            .column("bundle_id", ColType::BigInt, true)
            .column("secret_id", ColType::BigInt, true)
            .primary_key(&["bundle_id", "secret_id"])
            .foreign_key_cascade(&["bundle_id"], &t("bundles"), &["id"])
            .foreign_key(&["secret_id"], &t("secrets"), &["id"]),
        Table::new(t("sources_secrets"))
            .column("source_id", ColType::BigInt, true)
            .column("secret_id", ColType::BigInt, true)
            .primary_key(&["source_id", "secret_id"])
            .foreign_key_cascade(&["source_id"], &t("sources"), &["id"])
            .foreign_key(&["secret_id"], &t("secrets"), &["id"]),
        Table::new(t("datasources"))
            .column("source_id", ColType::BigInt, true)
            .text("name")
            .text("type")
            .text("path")
            .text_null("url")
            .text_null("transform_query")
            .text_null("config")
            .column("secret_id", ColType::BigInt, false)
            .primary_key(&["source_id", "name"])
            .foreign_key_cascade(&["source_id"], &t("sources"), &["id"]),
        Table::new(t("sources_data"))
            .column("source_id", ColType::BigInt, true)
            .text("path")
            .text("data")
            .primary_key(&["source_id", "path"])
            .foreign_key_cascade(&["source_id"], &t("sources"), &["id"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_names_are_deterministic() {
        let table = Table::new("bundles")
            .serial_id()
            .column("tenant_id", ColType::BigInt, true)
            .text("name")
            .unique(&["tenant_id", "name"])
            .foreign_key_cascade(&["tenant_id"], "tenants", &["id"]);
        let sql = table.create_sql(Dialect::Postgres, 2);
        assert!(sql.contains("CONSTRAINT 2_bundles_tenant_id_name_uq UNIQUE (tenant_id, name)"));
        assert!(sql.contains(
            "CONSTRAINT 2_bundles_tenant_id_fk FOREIGN KEY (tenant_id) REFERENCES tenants (id) ON DELETE CASCADE"
        ));
        assert!(sql.contains("id BIGSERIAL"));
    }

    #[test]
    fn test_sqlite_serial_is_inline_pk() {
        let table = Table::new("tenants").serial_id().text("name").primary_key(&["id"]);
        let sql = table.create_sql(Dialect::Sqlite, 2);
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!sql.contains("CONSTRAINT 2_tenants_id_pk"));
    }

    #[test]
    fn test_mysql_serial() {
        let table = Table::new("tenants").serial_id().primary_key(&["id"]);
        let sql = table.create_sql(Dialect::Mysql, 2);
        assert!(sql.contains("id BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(sql.contains("CONSTRAINT 2_tenants_id_pk PRIMARY KEY (id)"));
    }

    #[test]
    fn test_v2_suffix_applies_to_references() {
        let tables = v2_tables("_mt");
        let reqs = tables
            .iter()
            .find(|t| t.name == "bundles_requirements_mt")
            .unwrap();
        let sql = reqs.create_sql(Dialect::Sqlite, 2);
        assert!(sql.contains("REFERENCES bundles_mt (id)"));
        assert!(sql.contains("REFERENCES sources_mt (id)"));
    }
}
