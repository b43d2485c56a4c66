//! Package root bookkeeping and conflict detection.
//!
//! Every source contributes a set of package roots (from `package`
//! declarations and data file directories). Roots from different queue items
//! must not overlap: a shared prefix would make ownership of that subtree
//! ambiguous in the merged bundle.

use thiserror::Error;

use super::rewrite::is_path_prefix;

/// A data reference as path segments; empty means the whole data tree.
pub type Ref = Vec<String>;

pub fn ref_to_string(r: &[String]) -> String {
    if r.is_empty() {
        "data".to_string()
    } else {
        r.join(".")
    }
}

/// Build-time namespace collision between sources.
#[derive(Debug, Error)]
#[error("requirement {requirement:?} contains conflicting package {package}")]
pub struct PackageConflictErr {
    pub requirement: String,
    pub package: String,
    /// Human-readable owners of the overlapping roots, e.g.
    /// `package x from "system"`.
    pub overlap: Vec<String>,
    /// Every root registered so far with its owning source.
    pub roots: Vec<(Ref, String)>,
}

/// Canonicalize a root set: a shorter root subsumes any longer one.
pub fn canonical(mut roots: Vec<Ref>) -> Vec<Ref> {
    roots.sort();
    roots.dedup();
    let mut out: Vec<Ref> = Vec::new();
    for root in roots {
        if out.iter().any(|kept| is_path_prefix(kept, &root)) {
            continue;
        }
        out.retain(|kept| !is_path_prefix(&root, kept));
        out.push(root);
    }
    out.sort();
    out
}

/// Ordered record of which source owns which root.
#[derive(Debug, Default)]
pub struct RootSet {
    owners: Vec<(Ref, String)>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `new_roots` for `source`, failing when any of them shares a
    /// prefix with a root owned by an earlier queue item.
    pub fn check_and_add(
        &mut self,
        requirement: &str,
        source: &str,
        new_roots: Vec<Ref>,
    ) -> Result<(), PackageConflictErr> {
        for root in &new_roots {
            let overlap: Vec<String> = self
                .owners
                .iter()
                .filter(|(existing, _)| {
                    is_path_prefix(existing, root) || is_path_prefix(root, existing)
                })
                .map(|(existing, owner)| {
                    format!("package {} from {owner:?}", ref_to_string(existing))
                })
                .collect();
            if !overlap.is_empty() {
                return Err(PackageConflictErr {
                    requirement: requirement.to_string(),
                    package: ref_to_string(root),
                    overlap,
                    roots: self.owners.clone(),
                });
            }
        }
        for root in new_roots {
            self.owners.push((root, source.to_string()));
        }
        Ok(())
    }

    /// Slash-joined roots for the bundle manifest, sorted.
    pub fn manifest_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self.owners.iter().map(|(r, _)| r.join("/")).collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Ref {
        if s.is_empty() {
            Vec::new()
        } else {
            s.split('.').map(str::to_string).collect()
        }
    }

    #[test]
    fn test_canonical_prefers_shorter() {
        let roots = canonical(vec![path("a.b.c"), path("a.b"), path("z")]);
        assert_eq!(roots, vec![path("a.b"), path("z")]);
    }

    #[test]
    fn test_conflict_on_shared_prefix() {
        let mut set = RootSet::new();
        set.check_and_add("system", "system", vec![path("x")]).unwrap();
        let err = set
            .check_and_add("lib1", "lib1", vec![path("x.y")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "requirement \"lib1\" contains conflicting package x.y"
        );
        assert_eq!(err.overlap, vec!["package x from \"system\"".to_string()]);
    }

    #[test]
    fn test_disjoint_roots_are_fine() {
        let mut set = RootSet::new();
        set.check_and_add("system", "system", vec![path("a")]).unwrap();
        set.check_and_add("lib1", "lib1", vec![path("b.c")]).unwrap();
        assert_eq!(set.manifest_roots(), vec!["a".to_string(), "b/c".to_string()]);
    }

    #[test]
    fn test_empty_root_conflicts_with_everything() {
        let mut set = RootSet::new();
        set.check_and_add("system", "system", vec![Vec::new()]).unwrap();
        assert!(set.check_and_add("lib1", "lib1", vec![path("a")]).is_err());
    }
}
