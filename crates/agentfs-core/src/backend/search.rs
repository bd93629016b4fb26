//! Listing, grep and glob over in-memory file records.
//!
//! Shared by the state and store backends, which both hold whole files as
//! [`FileRecord`]s keyed by virtual path.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::BackendError;
use crate::record::FileRecord;
use crate::types::{FileInfo, GrepMatch, OutputMode};
use crate::util::path::{as_dir_prefix, is_under};
use crate::util::pattern::{build_glob_set, build_include_filter, compile_regex, file_name};

/// Direct children of `dir`: files as-is, deeper paths folded into directory entries.
pub fn list_children<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a FileRecord)>,
    dir: &str,
) -> Vec<FileInfo> {
    let prefix = as_dir_prefix(dir);
    let mut entries = Vec::new();
    let mut subdirs = BTreeSet::new();

    for (path, record) in files {
        let Some(rest) = path.strip_prefix(prefix.as_str()) else {
            continue;
        };
        match rest.split_once('/') {
            Some((child, _)) => {
                subdirs.insert(format!("{prefix}{child}/"));
            }
            None if !rest.is_empty() => {
                entries.push(FileInfo::file(path, record.size(), Some(record.modified_at.clone())));
            }
            None => {}
        }
    }

    entries.extend(subdirs.into_iter().map(FileInfo::dir));
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Regex search across records under `path`, optionally filtered by file name.
pub fn grep_records<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a FileRecord)>,
    pattern: &str,
    path: Option<&str>,
    include: Option<&str>,
) -> Result<Vec<GrepMatch>, BackendError> {
    let regex = compile_regex(pattern)?;
    let include = include.map(build_include_filter).transpose()?;
    let base = path.unwrap_or("/");

    let mut matches = Vec::new();
    for (file_path, record) in files {
        if !is_under(file_path, base) {
            continue;
        }
        if let Some(filter) = &include {
            if !filter.is_match(file_name(file_path)) {
                continue;
            }
        }
        for (idx, line) in record.content.iter().enumerate() {
            if regex.is_match(line) {
                matches.push(GrepMatch {
                    path: file_path.to_string(),
                    line: idx + 1,
                    text: line.clone(),
                });
            }
        }
    }
    Ok(matches)
}

/// Records under `path` whose path relative to it matches `pattern`.
pub fn glob_records<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a FileRecord)>,
    pattern: &str,
    path: &str,
) -> Result<Vec<FileInfo>, BackendError> {
    let set = build_glob_set(pattern.trim_start_matches('/'))
        .map_err(|e| BackendError::InvalidPattern(format!("Invalid glob pattern: {e}")))?;

    let mut infos: Vec<FileInfo> = files
        .into_iter()
        .filter_map(|(file_path, record)| {
            let rel = relative_to(file_path, path)?;
            set.is_match(rel)
                .then(|| FileInfo::file(file_path, record.size(), Some(record.modified_at.clone())))
        })
        .collect();
    infos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(infos)
}

/// Path of `file` relative to directory `base`, without a leading slash.
pub fn relative_to<'a>(file: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    let rest = file.strip_prefix(base)?;
    let rel = rest.strip_prefix('/')?;
    (!rel.is_empty()).then_some(rel)
}

/// Render grep matches: sorted paths, `path:line:text` lines, or `path:count`.
pub fn format_grep_results(matches: &[GrepMatch], mode: OutputMode) -> String {
    match mode {
        OutputMode::FilesWithMatches => matches
            .iter()
            .map(|m| m.path.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join("\n"),
        OutputMode::Content => {
            let mut sorted: Vec<&GrepMatch> = matches.iter().collect();
            sorted.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
            sorted
                .iter()
                .map(|m| format!("{}:{}:{}", m.path, m.line, m.text))
                .collect::<Vec<_>>()
                .join("\n")
        }
        OutputMode::Count => {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for m in matches {
                *counts.entry(m.path.as_str()).or_default() += 1;
            }
            counts
                .into_iter()
                .map(|(path, n)| format!("{path}:{n}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}
