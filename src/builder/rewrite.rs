//! Rego module package parsing and mount-driven renaming.

use std::sync::LazyLock;

use regex::Regex;

static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*package[ \t]+(?P<path>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
        .expect("package regex is valid")
});

/// Parse a dotted data reference into segments, dropping the implicit
/// `data` root. Empty input selects the whole data tree.
pub fn parse_ref(s: &str) -> Vec<String> {
    let s = s.trim();
    if s.is_empty() || s == "data" {
        return Vec::new();
    }
    let mut segments: Vec<String> = s.split('.').map(str::to_string).collect();
    if segments.first().is_some_and(|h| h == "data") {
        segments.remove(0);
    }
    segments
}

/// The package path declared by a Rego module, if any.
pub fn module_package(content: &str) -> Option<Vec<String>> {
    let caps = PACKAGE_RE.captures(content)?;
    Some(caps["path"].split('.').map(str::to_string).collect())
}

/// True when `prefix` is a (non-strict) prefix of `path`.
pub fn is_path_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

/// Relocate `path` from the `from` namespace into `to`.
///
/// Returns `None` when `path` is outside `from`; such modules are discarded
/// by the mount.
pub fn relocate(path: &[String], from: &[String], to: &[String]) -> Option<Vec<String>> {
    if !is_path_prefix(from, path) {
        return None;
    }
    let mut out = to.to_vec();
    out.extend_from_slice(&path[from.len()..]);
    Some(out)
}

/// Rewrite the module's `package` declaration to `new_package`.
pub fn rewrite_package(content: &str, new_package: &[String]) -> String {
    let replacement = format!("package {}", new_package.join("."));
    PACKAGE_RE.replace(content, replacement.as_str()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Vec<String> {
        s.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_parse_ref_strips_data_root() {
        assert_eq!(parse_ref("data.imported"), vec!["imported"]);
        assert_eq!(parse_ref("imported.abc"), vec!["imported", "abc"]);
        assert!(parse_ref("data").is_empty());
        assert!(parse_ref("").is_empty());
    }

    #[test]
    fn test_module_package() {
        let module = "# header\npackage lib2.q\n\ndefault allow := false\n";
        assert_eq!(module_package(module), Some(path("lib2.q")));
        assert_eq!(module_package("allow := true"), None);
    }

    #[test]
    fn test_relocate() {
        assert_eq!(relocate(&path("lib2.q"), &[], &path("abc")), Some(path("abc.lib2.q")));
        assert_eq!(
            relocate(&path("a.b.c"), &path("a.b"), &path("x")),
            Some(path("x.c"))
        );
        assert_eq!(relocate(&path("other"), &path("a"), &path("x")), None);
    }

    #[test]
    fn test_rewrite_package_preserves_body() {
        let module = "package lib2.q\n\nallow if input.x\n";
        let rewritten = rewrite_package(module, &path("imported.abc.lib2.q"));
        assert!(rewritten.starts_with("package imported.abc.lib2.q\n"));
        assert!(rewritten.contains("allow if input.x"));
    }
}
