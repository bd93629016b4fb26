//! Glob, include-filter and regex compilation.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::error::BackendError;

/// Expand brace groups: `*.{py,pyi}` becomes `["*.py", "*.pyi"]`.
///
/// Nested groups are expanded innermost first. Unbalanced or empty braces
/// are rejected.
pub fn expand_braces(pattern: &str) -> Result<Vec<String>, String> {
    let mut pending = vec![pattern.to_string()];
    let mut done = Vec::new();

    while let Some(pat) = pending.pop() {
        match innermost_group(&pat)? {
            Some((start, end)) => {
                let alternatives = &pat[start + 1..end];
                if alternatives.is_empty() {
                    return Err(format!("empty braces in '{pattern}'"));
                }
                for alt in alternatives.split(',') {
                    pending.push(format!("{}{}{}", &pat[..start], alt, &pat[end + 1..]));
                }
            }
            None => done.push(pat),
        }
    }

    done.reverse();
    let mut seen = std::collections::HashSet::new();
    done.retain(|p| seen.insert(p.clone()));
    Ok(done)
}

fn innermost_group(pattern: &str) -> Result<Option<(usize, usize)>, String> {
    let mut open = None;
    for (i, c) in pattern.char_indices() {
        match c {
            '{' => open = Some(i),
            '}' => {
                return match open {
                    Some(start) => Ok(Some((start, i))),
                    None => Err(format!("unmatched '}}' in '{pattern}'")),
                };
            }
            _ => {}
        }
    }
    if open.is_some() {
        return Err(format!("unmatched '{{' in '{pattern}'"));
    }
    Ok(None)
}

/// Compile a path glob. `*` stays within one path segment, `**` crosses them.
pub fn build_glob_set(pattern: &str) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pat in expand_braces(pattern)? {
        let glob = GlobBuilder::new(&pat)
            .literal_separator(true)
            .build()
            .map_err(|e| format!("invalid glob pattern '{pat}': {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| e.to_string())
}

/// Compile an include filter matched against file names.
pub fn build_include_filter(include: &str) -> Result<GlobSet, BackendError> {
    build_glob_set(include)
        .map_err(|e| BackendError::InvalidPattern(format!("Invalid include pattern: {e}")))
}

pub fn is_valid_include_pattern(include: &str) -> bool {
    build_glob_set(include).is_ok()
}

/// Compile a search regex, mapping failures to the in-band message callers expect.
pub fn compile_regex(pattern: &str) -> Result<Regex, BackendError> {
    Regex::new(pattern).map_err(|e| BackendError::InvalidPattern(format!("Invalid regex pattern: {e}")))
}

/// Final path component of a virtual path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
