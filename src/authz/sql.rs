//! SQL expression tree produced by partial evaluation.
//!
//! The tree is dialect-agnostic: rendering takes a placeholder function so
//! the store can emit `$N` for PostgreSQL and `?` elsewhere, and collects
//! the argument values in render order.

use std::collections::BTreeSet;

/// A bind argument produced while rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Qualified column reference, rendered as `table.column`.
    Column { table: String, column: String },
    /// String literal, rendered as a placeholder.
    Str(String),
    /// Integer literal, rendered as a placeholder.
    Int(i64),
}

impl Term {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Term::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    fn table(&self) -> Option<&str> {
        match self {
            Term::Column { table, .. } => Some(table),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Eq(Term, Term),
    IsNotNull(Term),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Exists {
        /// Tables joined inside the subquery, in declaration order.
        tables: Vec<String>,
        cond: Box<Expr>,
    },
}

impl Expr {
    pub fn is_true(&self) -> bool {
        matches!(self, Expr::Bool(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Expr::Bool(false))
    }

    /// Every table referenced anywhere in the expression.
    pub fn tables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tables(&mut out);
        out
    }

    fn collect_tables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Bool(_) => {}
            Expr::Eq(a, b) => {
                if let Some(t) = a.table() {
                    out.insert(t.to_string());
                }
                if let Some(t) = b.table() {
                    out.insert(t.to_string());
                }
            }
            Expr::IsNotNull(t) => {
                if let Some(t) = t.table() {
                    out.insert(t.to_string());
                }
            }
            Expr::And(exprs) | Expr::Or(exprs) => {
                for expr in exprs {
                    expr.collect_tables(out);
                }
            }
            Expr::Exists { tables, cond } => {
                out.extend(tables.iter().cloned());
                cond.collect_tables(out);
            }
        }
    }

    /// Render to SQL. `placeholder(i)` formats the 1-based i-th parameter;
    /// argument values are appended to `args` in render order.
    pub fn sql(&self, placeholder: &dyn Fn(usize) -> String, args: &mut Vec<SqlValue>) -> String {
        match self {
            Expr::Bool(true) => "1 = 1".to_string(),
            Expr::Bool(false) => "1 = 0".to_string(),
            Expr::Eq(a, b) => {
                let left = render_term(a, placeholder, args);
                let right = render_term(b, placeholder, args);
                format!("{left} = {right}")
            }
            Expr::IsNotNull(t) => {
                let term = render_term(t, placeholder, args);
                format!("{term} IS NOT NULL")
            }
            Expr::And(exprs) => join_exprs(exprs, " AND ", placeholder, args),
            Expr::Or(exprs) => join_exprs(exprs, " OR ", placeholder, args),
            Expr::Exists { tables, cond } => {
                let inner = cond.sql(placeholder, args);
                format!("EXISTS (SELECT 1 FROM {} WHERE {inner})", tables.join(", "))
            }
        }
    }
}

fn join_exprs(
    exprs: &[Expr],
    sep: &str,
    placeholder: &dyn Fn(usize) -> String,
    args: &mut Vec<SqlValue>,
) -> String {
    if exprs.is_empty() {
        return "1 = 1".to_string();
    }
    let parts: Vec<String> = exprs
        .iter()
        .map(|e| format!("({})", e.sql(placeholder, args)))
        .collect();
    parts.join(sep)
}

fn render_term(
    term: &Term,
    placeholder: &dyn Fn(usize) -> String,
    args: &mut Vec<SqlValue>,
) -> String {
    match term {
        Term::Column { table, column } => format!("{table}.{column}"),
        Term::Str(s) => {
            args.push(SqlValue::Str(s.clone()));
            placeholder(args.len())
        }
        Term::Int(i) => {
            args.push(SqlValue::Int(*i));
            placeholder(args.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exists_with_placeholders() {
        let expr = Expr::Exists {
            tables: vec!["principals".to_string(), "tenants".to_string()],
            cond: Box::new(Expr::And(vec![
                Expr::Eq(
                    Term::column("principals", "id"),
                    Term::Str("bob".to_string()),
                ),
                Expr::Eq(
                    Term::column("principals", "tenant_id"),
                    Term::column("tenants", "id"),
                ),
            ])),
        };
        let mut args = Vec::new();
        let sql = expr.sql(&|i| format!("${i}"), &mut args);
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM principals, tenants WHERE (principals.id = $1) AND (principals.tenant_id = tenants.id))"
        );
        assert_eq!(args, vec![SqlValue::Str("bob".to_string())]);
    }

    #[test]
    fn test_placeholder_offsets_continue() {
        let expr = Expr::Eq(Term::column("t", "c"), Term::Str("v".to_string()));
        let mut args = vec![SqlValue::Str("pre-existing".to_string())];
        let sql = expr.sql(&|i| format!("${i}"), &mut args);
        assert_eq!(sql, "t.c = $2");
    }

    #[test]
    fn test_tables() {
        let expr = Expr::Or(vec![
            Expr::Exists {
                tables: vec!["resource_permissions".to_string()],
                cond: Box::new(Expr::Eq(
                    Term::column("resource_permissions", "name"),
                    Term::column("sources", "name"),
                )),
            },
            Expr::IsNotNull(Term::column("tenants", "id")),
        ]);
        let tables: Vec<_> = expr.tables().into_iter().collect();
        assert_eq!(tables, vec!["resource_permissions", "sources", "tenants"]);
    }
}
