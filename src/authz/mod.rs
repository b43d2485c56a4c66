//! # Authorization Compiler
//!
//! Compiles the embedded declarative policy into per-request SQL `WHERE`
//! fragments. For every access descriptor the policy is partially evaluated:
//! conditions over the descriptor disappear (dropping rules whose known
//! conditions fail), conditions over database columns remain as residual
//! equalities. Each surviving rule becomes an `EXISTS (SELECT 1 FROM …)`
//! clause over the tables it references (minus the target table, joined by
//! the outer query), and the clauses are OR-ed together.
//!
//! Translations are cached by a canonical serialization of the access
//! descriptor plus any extra column mappings; the policy itself is static,
//! so entries never go stale and are only dropped by eviction.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;

mod policy;
pub mod sql;

pub use sql::{Expr, SqlValue, Term};

use policy::{permission_matches, Field, PCond, PTerm, RULES};

/// Number of cached translations kept before eviction.
const CACHE_CAPACITY: usize = 128;

/// The 5-tuple fed to the authorization policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub principal: String,
    pub tenant: String,
    pub resource: String,
    pub permission: String,
    /// Known resource name for write checks; `None` for list/get queries,
    /// where `input.name` is mapped to a column instead.
    pub name: Option<String>,
}

impl Access {
    pub fn new(
        principal: impl Into<String>,
        tenant: impl Into<String>,
        resource: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            tenant: tenant.into(),
            resource: resource.into(),
            permission: permission.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A qualified column an input field is mapped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Extra unknowns declared to partial evaluation, keyed by input field
/// (e.g. `input.name` → `sources.name`).
pub type ColumnMappings = BTreeMap<String, ColumnRef>;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("authorization policy: unsupported construct: {0}")]
    Translate(String),
}

#[derive(Default)]
struct TranslationCache {
    map: HashMap<String, Arc<Expr>>,
    order: VecDeque<String>,
}

impl TranslationCache {
    fn insert(&mut self, key: String, value: Arc<Expr>) {
        if self.map.len() >= CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }
}

/// Partial evaluator over the embedded policy with a bounded translation
/// cache.
#[derive(Default)]
pub struct Authorizer {
    cache: Mutex<TranslationCache>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `access` into an SQL fragment, using the cache.
    ///
    /// The mutex is held across miss computation so concurrent requests for
    /// the same key translate once.
    pub fn partial(
        &self,
        access: &Access,
        extra: &ColumnMappings,
    ) -> Result<Arc<Expr>, AuthzError> {
        let key = cache_key(access, extra);
        let mut cache = self.cache.lock().expect("authz cache mutex poisoned");
        if let Some(expr) = cache.map.get(&key) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(evaluate(access, extra)?);
        cache.insert(key, expr.clone());
        Ok(expr)
    }

    /// Uncached evaluation, used by tests to cross-check cached results.
    pub fn partial_uncached(
        &self,
        access: &Access,
        extra: &ColumnMappings,
    ) -> Result<Expr, AuthzError> {
        evaluate(access, extra)
    }
}

fn cache_key(access: &Access, extra: &ColumnMappings) -> String {
    use std::fmt::Write;
    let mut key = String::new();
    for part in [
        &access.principal,
        &access.tenant,
        &access.resource,
        &access.permission,
    ] {
        key.push_str(part);
        key.push('\u{1f}');
    }
    key.push_str(access.name.as_deref().unwrap_or("\u{2400}"));
    // BTreeMap iteration is sorted, so equivalent mappings serialize
    // identically regardless of insertion order.
    for (field, col) in extra {
        let _ = write!(key, "\u{1f}{field}={}.{}", col.table, col.column);
    }
    key
}

enum Resolved {
    Known(String),
    Unknown(Term),
    Undefined,
}

fn resolve(term: &PTerm, access: &Access, extra: &ColumnMappings) -> Resolved {
    match term {
        PTerm::Lit(s) => Resolved::Known((*s).to_string()),
        PTerm::Col(table, column) => Resolved::Unknown(Term::column(*table, *column)),
        PTerm::Input(field) => {
            if let Some(col) = extra.get(field.key()) {
                return Resolved::Unknown(Term::column(col.table.clone(), col.column.clone()));
            }
            let value = match field {
                Field::Principal => Some(access.principal.clone()),
                Field::Tenant => Some(access.tenant.clone()),
                Field::Resource => Some(access.resource.clone()),
                Field::Permission => Some(access.permission.clone()),
                Field::Name => access.name.clone(),
            };
            match value {
                Some(v) => Resolved::Known(v),
                None => Resolved::Undefined,
            }
        }
    }
}

fn evaluate(access: &Access, extra: &ColumnMappings) -> Result<Expr, AuthzError> {
    let mut disjuncts = Vec::new();

    'rules: for rule in RULES {
        let mut residual = Vec::new();
        for cond in rule.conds {
            match cond {
                PCond::PermissionLike(pattern) => {
                    if !permission_matches(pattern, &access.permission) {
                        continue 'rules;
                    }
                }
                PCond::Eq(a, b) => {
                    let left = resolve(a, access, extra);
                    let right = resolve(b, access, extra);
                    match (left, right) {
                        (Resolved::Undefined, _) | (_, Resolved::Undefined) => continue 'rules,
                        (Resolved::Known(l), Resolved::Known(r)) => {
                            if l != r {
                                continue 'rules;
                            }
                        }
                        (Resolved::Unknown(t), Resolved::Known(v))
                        | (Resolved::Known(v), Resolved::Unknown(t)) => {
                            residual.push(Expr::Eq(t, Term::Str(v)));
                        }
                        (Resolved::Unknown(l), Resolved::Unknown(r)) => {
                            residual.push(Expr::Eq(l, r));
                        }
                    }
                }
            }
        }

        if residual.is_empty() {
            // Every condition was known and true: unconditional grant.
            return Ok(Expr::Bool(true));
        }
        disjuncts.push(wrap_exists(&access.resource, residual)?);
    }

    if disjuncts.is_empty() {
        return Ok(Expr::Bool(false));
    }
    Ok(Expr::Or(disjuncts))
}

/// Wrap one rule's residual conjunction into an EXISTS subquery over the
/// tables it references, excluding the caller's target table (it is joined
/// from the outer query).
fn wrap_exists(target_table: &str, residual: Vec<Expr>) -> Result<Expr, AuthzError> {
    let cond = Expr::And(residual);
    let tables: Vec<String> = cond
        .tables()
        .into_iter()
        .filter(|t| t != target_table)
        .collect();
    if tables.is_empty() {
        return Err(AuthzError::Translate(format!(
            "residual references only the target table {target_table:?}"
        )));
    }
    Ok(Expr::Exists {
        tables,
        cond: Box::new(cond),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn name_mapping(table: &str) -> ColumnMappings {
        ColumnMappings::from([(
            "input.name".to_string(),
            ColumnRef::new(table, "name"),
        )])
    }

    fn args_of(expr: &Expr) -> BTreeSet<String> {
        let mut args = Vec::new();
        expr.sql(&|_| "?".to_string(), &mut args);
        args.into_iter()
            .map(|v| match v {
                SqlValue::Str(s) => s,
                SqlValue::Int(i) => i.to_string(),
                SqlValue::Bool(b) => b.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_internal_short_circuits() {
        let authz = Authorizer::new();
        let access = Access::new("internal", "One", "sources", "sources.manage");
        let expr = authz.partial(&access, &ColumnMappings::new()).unwrap();
        assert!(expr.is_true());
    }

    #[test]
    fn test_list_fragment_shape() {
        let authz = Authorizer::new();
        let access = Access::new("bob", "One", "sources", "sources.view");
        let expr = authz.partial(&access, &name_mapping("sources")).unwrap();

        let Expr::Or(clauses) = expr.as_ref() else {
            panic!("expected a disjunction, got {expr:?}");
        };
        assert_eq!(clauses.len(), 4);

        let mut principal_clauses = 0;
        let mut permission_clauses = 0;
        for clause in clauses {
            let Expr::Exists { tables, .. } = clause else {
                panic!("expected EXISTS, got {clause:?}");
            };
            assert!(tables.contains(&"tenants".to_string()));
            assert!(!tables.contains(&"sources".to_string()));
            if tables.contains(&"principals".to_string()) {
                principal_clauses += 1;
            }
            if tables.contains(&"resource_permissions".to_string()) {
                permission_clauses += 1;
            }
        }
        assert_eq!(principal_clauses, 2);
        assert_eq!(permission_clauses, 2);

        let expected: BTreeSet<String> = [
            "sources",
            "bob",
            "sources.view",
            "One",
            "owner",
            "viewer",
            "administrator",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        assert_eq!(args_of(&expr), expected);
    }

    #[test]
    fn test_manage_excludes_viewer_clause() {
        let authz = Authorizer::new();
        let access = Access::new("bob", "One", "sources", "sources.manage").with_name("x123");
        let expr = authz.partial(&access, &ColumnMappings::new()).unwrap();
        let Expr::Or(clauses) = expr.as_ref() else {
            panic!("expected a disjunction");
        };
        // administrator + the two per-object ACL rules.
        assert_eq!(clauses.len(), 3);
        assert!(args_of(&expr).contains("x123"));
    }

    #[test]
    fn test_stack_owner_only_for_stacks() {
        let authz = Authorizer::new();
        let stacks = Access::new("bob", "One", "stacks", "stacks.manage").with_name("s");
        let expr = authz.partial(&stacks, &ColumnMappings::new()).unwrap();
        let Expr::Or(clauses) = expr.as_ref() else {
            panic!("expected a disjunction");
        };
        assert_eq!(clauses.len(), 4);
        assert!(args_of(&expr).contains("stack_owner"));
    }

    #[test]
    fn test_cached_equals_uncached() {
        let authz = Authorizer::new();
        let access = Access::new("bob", "One", "bundles", "bundles.view");
        let mappings = name_mapping("bundles");
        let cached = authz.partial(&access, &mappings).unwrap();
        let again = authz.partial(&access, &mappings).unwrap();
        let uncached = authz.partial_uncached(&access, &mappings).unwrap();
        assert_eq!(cached.as_ref(), &uncached);
        assert!(Arc::ptr_eq(&cached, &again));
    }

    #[test]
    fn test_cache_key_is_canonical() {
        let mut a = ColumnMappings::new();
        a.insert("input.name".to_string(), ColumnRef::new("sources", "name"));
        a.insert("input.tenant".to_string(), ColumnRef::new("tenants", "name"));
        let mut b = ColumnMappings::new();
        b.insert("input.tenant".to_string(), ColumnRef::new("tenants", "name"));
        b.insert("input.name".to_string(), ColumnRef::new("sources", "name"));
        let access = Access::new("bob", "One", "sources", "sources.view");
        assert_eq!(cache_key(&access, &a), cache_key(&access, &b));
    }

    #[test]
    fn test_unknown_principal_without_grants_is_denied_at_rows() {
        let authz = Authorizer::new();
        // No name and no mapping: per-object rules drop as undefined, role
        // rules remain.
        let access = Access::new("mallory", "One", "sources", "sources.manage");
        let expr = authz.partial(&access, &ColumnMappings::new()).unwrap();
        let Expr::Or(clauses) = expr.as_ref() else {
            panic!("expected a disjunction");
        };
        assert_eq!(clauses.len(), 1); // administrator only
    }
}
