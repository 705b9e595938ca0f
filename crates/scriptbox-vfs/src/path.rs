// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path helpers for the virtual filesystem.
//!
//! Every path inside the VFS is absolute and `/`-separated. All helpers here
//! are derived from [`normalize`], so they agree on the root, trailing
//! slashes and repeated separators.

/// Split a path into its normalized components (`.`/`..` resolved)
pub fn components(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            // `..` above the root collapses to the root
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts
}

/// Normalize a path to its absolute, `/`-separated form.
///
/// The empty string normalizes to `/`, backslashes are separators and `..`
/// never climbs above the root.
pub fn normalize(path: &str) -> String {
    let parts = components(path);
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\')
}

/// Join path segments and normalize the result
pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join("/");
    normalize(&joined)
}

/// Resolve `path` against `base`; absolute paths ignore the base
pub fn resolve(base: &str, path: &str) -> String {
    if is_absolute(path) {
        normalize(path)
    } else {
        join(&[base, path])
    }
}

/// Split a path into `(parent, name)`. The root splits into `("/", "")`.
pub fn split(path: &str) -> (String, String) {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) => ("/".to_string(), normalized[1..].to_string()),
        Some(idx) => (normalized[..idx].to_string(), normalized[idx + 1..].to_string()),
        None => ("/".to_string(), normalized),
    }
}

pub fn dirname(path: &str) -> String {
    split(path).0
}

/// Final path component, with `suffix` stripped when it is a proper suffix
pub fn basename(path: &str, suffix: Option<&str>) -> String {
    let name = split(path).1;
    match suffix {
        Some(suffix) if !suffix.is_empty() && name.len() > suffix.len() => {
            name.strip_suffix(suffix).map(str::to_string).unwrap_or(name)
        }
        _ => name,
    }
}

/// Extension of the final component including the dot, or `""`.
/// Leading dots (`.bashrc`) do not start an extension.
pub fn extname(path: &str) -> String {
    let name = basename(path, None);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_string(),
        _ => String::new(),
    }
}

/// True when `path` is `ancestor` or lies beneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = normalize(path);
    let ancestor = normalize(ancestor);
    if ancestor == "/" || path == ancestor {
        return true;
    }
    path.strip_prefix(&ancestor).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_edge_cases() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a//b/"), "/a/b");
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../../x"), "/x");
        assert_eq!(normalize("\\win\\style\\path"), "/win/style/path");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "", "/", ".", "..", "a", "/a/b/", "//a//b//", "a/../../b", "/x/./y/../z", "\\a\\..\\b",
            "/a/b/c/../../..", "./rel/./path/",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "normalize not idempotent for {sample:?}");
        }
    }

    #[test]
    fn split_dirname_basename_agree() {
        assert_eq!(split("/"), ("/".to_string(), "".to_string()));
        assert_eq!(split("/file.txt"), ("/".to_string(), "file.txt".to_string()));
        assert_eq!(split("/a/b/"), ("/a".to_string(), "b".to_string()));
        assert_eq!(dirname("/a//b/c.js"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(basename("/a/b/c.js", None), "c.js");
        assert_eq!(basename("/a/b/c.js", Some(".js")), "c");
        assert_eq!(basename("/a/b/.js", Some(".js")), ".js");
        assert_eq!(basename("/", None), "");
    }

    #[test]
    fn extname_ignores_dotfiles() {
        assert_eq!(extname("/src/index.tsx"), ".tsx");
        assert_eq!(extname("/home/.bashrc"), "");
        assert_eq!(extname("/a.b/c"), "");
        assert_eq!(extname("/archive.tar.gz"), ".gz");
    }

    #[test]
    fn join_and_resolve() {
        assert_eq!(join(&["/src", "lib", "../math.js"]), "/src/math.js");
        assert_eq!(join::<&str>(&[]), "/");
        assert_eq!(resolve("/src", "./math"), "/src/math");
        assert_eq!(resolve("/src", "/abs/x"), "/abs/x");
        assert_eq!(resolve("/src/deep", "../../../up"), "/up");
        assert!(is_absolute("/x"));
        assert!(!is_absolute("x/y"));
    }

    #[test]
    fn within_checks_component_boundaries() {
        assert!(is_within("/a/b/c", "/a/b"));
        assert!(is_within("/a/b", "/a/b/"));
        assert!(!is_within("/a/bc", "/a/b"));
        assert!(is_within("/anything", "/"));
    }
}
