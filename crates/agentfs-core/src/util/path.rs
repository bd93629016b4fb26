//! Virtual path validation.
//!
//! Every path supplied by a caller passes through [`validate_and_normalize`]
//! before any backend sees it.

use crate::error::PathError;

/// Validate a virtual path and return its canonical form.
///
/// Rejects `..` anywhere and a leading `~`. Backslashes become slashes,
/// empty and `.` segments are dropped, a trailing slash is removed and the
/// result always starts with `/`. With `allowed_prefixes`, the normalized path
/// must start with one of them.
pub fn validate_and_normalize(
    path: &str,
    allowed_prefixes: Option<&[String]>,
) -> Result<String, PathError> {
    if path.contains("..") || path.starts_with('~') {
        return Err(PathError::Traversal(path.to_string()));
    }

    let unified = path.replace('\\', "/");
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let normalized = format!("/{}", segments.join("/"));

    if let Some(prefixes) = allowed_prefixes {
        if !prefixes.iter().any(|p| normalized.starts_with(p.as_str())) {
            return Err(PathError::NotAllowed {
                path: normalized,
                allowed: prefixes.to_vec(),
            });
        }
    }

    Ok(normalized)
}

/// Ensure a directory-like path ends with exactly one `/`.
pub fn as_dir_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// True when `file` lies at or below the virtual directory `dir`.
pub fn is_under(file: &str, dir: &str) -> bool {
    if dir == "/" || dir.is_empty() {
        return true;
    }
    let dir = dir.trim_end_matches('/');
    file == dir || file.starts_with(&format!("{dir}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_separators() {
        assert_eq!(validate_and_normalize("notes.txt", None).unwrap(), "/notes.txt");
        assert_eq!(validate_and_normalize("//a//b/./c", None).unwrap(), "/a/b/c");
        assert_eq!(validate_and_normalize("/dir/", None).unwrap(), "/dir");
        assert_eq!(validate_and_normalize("a\\b\\c.txt", None).unwrap(), "/a/b/c.txt");
        assert_eq!(validate_and_normalize("/", None).unwrap(), "/");
    }

    #[test]
    fn test_rejects_traversal() {
        for bad in ["../etc/passwd", "/a/../../b", "~/secrets", "~"] {
            assert!(matches!(
                validate_and_normalize(bad, None),
                Err(PathError::Traversal(_))
            ));
        }
    }

    #[test]
    fn test_allowed_prefixes() {
        let allowed = vec!["/workspace/".to_string()];
        assert!(validate_and_normalize("/workspace/a.txt", Some(&allowed)).is_ok());
        let err = validate_and_normalize("/etc/hosts", Some(&allowed)).unwrap_err();
        assert!(matches!(err, PathError::NotAllowed { .. }));
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/a/b.txt", "/"));
        assert!(is_under("/a/b.txt", "/a"));
        assert!(is_under("/a/b.txt", "/a/"));
        assert!(is_under("/a", "/a"));
        assert!(!is_under("/ab/c.txt", "/a"));
    }

    #[test]
    fn test_as_dir_prefix() {
        assert_eq!(as_dir_prefix("/"), "/");
        assert_eq!(as_dir_prefix("/a"), "/a/");
        assert_eq!(as_dir_prefix("/a/"), "/a/");
    }
}
