//! Path normalization.
//!
//! Store paths are absolute, `/`-separated strings with no `.`, `..`, empty,
//! or trailing components. `/` itself is the implicit root directory.

use strata_types::{VfsError, VfsResult};

/// The root directory.
pub const ROOT: &str = "/";

/// Normalize a path: make it absolute, resolve `.` and `..`.
///
/// `..` at the root stays at the root. Relative paths are taken relative to `/`.
pub fn normalize(path: &str) -> VfsResult<String> {
    if path.contains('\0') {
        return Err(VfsError::invalid_argument(format!(
            "path contains NUL: {path:?}"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    Ok(out)
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => Some(ROOT),
    }
}

/// Final component of a normalized path (empty for the root).
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Join a normalized directory and a single name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Whether `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor || is_descendant(path, ancestor)
}

/// Move `path` from under `from` to under `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    let rest = &path[from.len()..];
    if to == ROOT {
        if rest.is_empty() { ROOT.to_string() } else { rest.to_string() }
    } else {
        format!("{to}{rest}")
    }
}

/// Resolve a symlink target relative to the directory holding the link.
pub fn resolve_target(link: &str, target: &str) -> VfsResult<String> {
    if target.starts_with('/') {
        normalize(target)
    } else {
        let dir = parent(link).unwrap_or(ROOT);
        normalize(&format!("{dir}/{target}"))
    }
}

/// Ancestors of a normalized path from the top down, excluding the root
/// and the path itself.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for (i, b) in path.bytes().enumerate().skip(1) {
        if b == b'/' {
            out.push(&path[..i]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("/a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/../../a").unwrap(), "/a");
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn test_descendants() {
        assert!(is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(!is_descendant("/a", "/a"));
        assert!(is_descendant("/a", "/"));
        assert!(is_within("/a", "/a"));
        assert_eq!(rebase("/a/b/c", "/a", "/x"), "/x/b/c");
        assert_eq!(rebase("/a/b", "/a", "/"), "/b");
        assert_eq!(ancestors("/a/b/c"), vec!["/a", "/a/b"]);
        assert!(ancestors("/a").is_empty());
    }

    #[test]
    fn test_symlink_targets() {
        assert_eq!(resolve_target("/d/link", "file").unwrap(), "/d/file");
        assert_eq!(resolve_target("/d/link", "../x").unwrap(), "/x");
        assert_eq!(resolve_target("/d/link", "/abs").unwrap(), "/abs");
    }
}
