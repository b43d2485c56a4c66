//! The embedded authorization policy.
//!
//! Roles and per-object ACL rules expressed as conjunctions over the access
//! descriptor (known at evaluation time) and database columns (the unknowns
//! left for the SQL translation). Rules referencing only known terms
//! evaluate away entirely; the rest leave residual conditions.

/// Input fields of the access descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    Principal,
    Tenant,
    Resource,
    Permission,
    Name,
}

impl Field {
    pub(crate) fn key(self) -> &'static str {
        match self {
            Field::Principal => "input.principal",
            Field::Tenant => "input.tenant",
            Field::Resource => "input.resource",
            Field::Permission => "input.permission",
            Field::Name => "input.name",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PTerm {
    Input(Field),
    Col(&'static str, &'static str),
    Lit(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PCond {
    Eq(PTerm, PTerm),
    /// Known-only glob over the requested permission: `*.view`, `stacks.*`.
    PermissionLike(&'static str),
}

pub(crate) struct PRule {
    pub name: &'static str,
    pub conds: &'static [PCond],
}

use Field::*;
use PCond::*;
use PTerm::*;

/// Rules are tried in order; the first one that evaluates away to an
/// unconditional grant short-circuits the whole disjunction.
pub(crate) const RULES: &[PRule] = &[
    // The in-process principal used by config loading and workers.
    PRule {
        name: "internal",
        conds: &[Eq(Input(Principal), Lit("internal"))],
    },
    // Administrators hold every permission within their tenant.
    PRule {
        name: "administrator",
        conds: &[
            Eq(Col("principals", "id"), Input(Principal)),
            Eq(Col("principals", "role"), Lit("administrator")),
            Eq(Col("principals", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
        ],
    },
    // Viewers hold every view permission within their tenant.
    PRule {
        name: "viewer",
        conds: &[
            Eq(Col("principals", "id"), Input(Principal)),
            Eq(Col("principals", "role"), Lit("viewer")),
            Eq(Col("principals", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
            PermissionLike("*.view"),
        ],
    },
    // Owners may create resources; management of what they created flows
    // through the per-object ACL below.
    PRule {
        name: "owner",
        conds: &[
            Eq(Col("principals", "id"), Input(Principal)),
            Eq(Col("principals", "role"), Lit("owner")),
            Eq(Col("principals", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
            PermissionLike("*.create"),
        ],
    },
    // Stack owners hold every stacks permission within their tenant.
    PRule {
        name: "stack_owner",
        conds: &[
            Eq(Col("principals", "id"), Input(Principal)),
            Eq(Col("principals", "role"), Lit("stack_owner")),
            Eq(Col("principals", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
            PermissionLike("stacks.*"),
        ],
    },
    // Per-object ACL: the owner role on a named resource.
    PRule {
        name: "resource_owner",
        conds: &[
            Eq(Col("resource_permissions", "principal_id"), Input(Principal)),
            Eq(Col("resource_permissions", "resource"), Input(Resource)),
            Eq(Col("resource_permissions", "name"), Input(Name)),
            Eq(Col("resource_permissions", "role"), Lit("owner")),
            Eq(Col("resource_permissions", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
        ],
    },
    // Per-object ACL: an explicit permission grant.
    PRule {
        name: "resource_permission",
        conds: &[
            Eq(Col("resource_permissions", "principal_id"), Input(Principal)),
            Eq(Col("resource_permissions", "resource"), Input(Resource)),
            Eq(Col("resource_permissions", "name"), Input(Name)),
            Eq(Col("resource_permissions", "permission"), Input(Permission)),
            Eq(Col("resource_permissions", "tenant_id"), Col("tenants", "id")),
            Eq(Col("tenants", "name"), Input(Tenant)),
        ],
    },
];

/// Match a permission against a single-wildcard pattern.
pub(crate) fn permission_matches(pattern: &str, permission: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            permission.len() >= prefix.len() + suffix.len()
                && permission.starts_with(prefix)
                && permission.ends_with(suffix)
        }
        None => pattern == permission,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_matches() {
        assert!(permission_matches("*.view", "sources.view"));
        assert!(!permission_matches("*.view", "sources.manage"));
        assert!(permission_matches("stacks.*", "stacks.manage"));
        assert!(!permission_matches("stacks.*", "bundles.manage"));
        assert!(permission_matches("bundles.view", "bundles.view"));
    }
}
