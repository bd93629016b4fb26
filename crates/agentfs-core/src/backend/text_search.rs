//! Content search strategies for the local filesystem backend.
//!
//! The backend tries each configured [`TextSearch`] in order and takes the
//! first one that is available. [`RipgrepSearch`] shells out to `rg`;
//! [`RegexWalkSearch`] never fails and sits last in the chain.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::util::pattern::{build_include_filter, compile_regex, expand_braces};

/// Default bound on one external search.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One content search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub pattern: String,
    /// File or directory to search.
    pub base: PathBuf,
    /// File-name glob filter.
    pub include: Option<String>,
    /// Files larger than this are skipped.
    pub max_file_size: u64,
}

/// A match in host-path terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

/// The strategy could not run; the next one should be tried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{strategy} unavailable: {reason}")]
pub struct SearchUnavailable {
    pub strategy: &'static str,
    pub reason: String,
}

#[async_trait]
pub trait TextSearch: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, req: &SearchRequest) -> Result<Vec<RawMatch>, SearchUnavailable>;
}

// ====== RipgrepSearch ======

pub struct RipgrepSearch {
    binary: PathBuf,
    timeout: Duration,
}

impl RipgrepSearch {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Locate `rg` on `PATH`.
    pub fn detect(timeout: Duration) -> Option<Self> {
        which::which("rg").ok().map(|binary| Self::new(binary, timeout))
    }

    fn unavailable(&self, reason: impl Into<String>) -> SearchUnavailable {
        SearchUnavailable {
            strategy: self.name(),
            reason: reason.into(),
        }
    }
}

#[derive(Deserialize)]
struct RgEvent {
    #[serde(rename = "type")]
    kind: String,
    data: Option<RgMatchData>,
}

#[derive(Deserialize)]
struct RgMatchData {
    path: RgText,
    lines: RgText,
    line_number: Option<usize>,
}

#[derive(Deserialize)]
struct RgText {
    text: Option<String>,
}

fn parse_rg_json(stdout: &str) -> Vec<RawMatch> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<RgEvent>(line).ok())
        .filter(|event| event.kind == "match")
        .filter_map(|event| {
            let data = event.data?;
            Some(RawMatch {
                path: PathBuf::from(data.path.text?),
                line: data.line_number?,
                text: data
                    .lines
                    .text
                    .unwrap_or_default()
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl TextSearch for RipgrepSearch {
    fn name(&self) -> &'static str {
        "ripgrep"
    }

    async fn search(&self, req: &SearchRequest) -> Result<Vec<RawMatch>, SearchUnavailable> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--json")
            .arg("--max-filesize")
            .arg(req.max_file_size.to_string());
        if let Some(include) = &req.include {
            let globs = expand_braces(include).map_err(|e| self.unavailable(e))?;
            for glob in globs {
                cmd.arg("--glob").arg(glob);
            }
        }
        cmd.arg("--")
            .arg(&req.pattern)
            .arg(&req.base)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unavailable(format!("failed to spawn: {e}"))),
            Err(_) => {
                return Err(self.unavailable(format!("timed out after {}s", self.timeout.as_secs())))
            }
        };

        // Exit code 1 means no matches.
        match output.status.code() {
            Some(0) | Some(1) => Ok(parse_rg_json(&String::from_utf8_lossy(&output.stdout))),
            code => Err(self.unavailable(format!(
                "exit status {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

// ====== RegexWalkSearch ======

/// In-process search: walk the tree and match each line with `regex`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexWalkSearch;

impl RegexWalkSearch {
    fn search_blocking(req: &SearchRequest) -> Result<Vec<RawMatch>, SearchUnavailable> {
        let unavailable = |reason: String| SearchUnavailable {
            strategy: "regex",
            reason,
        };
        let regex = compile_regex(&req.pattern).map_err(|e| unavailable(e.to_string()))?;
        let include = req
            .include
            .as_deref()
            .map(build_include_filter)
            .transpose()
            .map_err(|e| unavailable(e.to_string()))?;

        let mut matches = Vec::new();
        for entry in WalkDir::new(&req.base).sort_by_file_name().into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(filter) = &include {
                if !filter.is_match(entry.file_name()) {
                    continue;
                }
            }
            match entry.metadata() {
                Ok(meta) if meta.len() <= req.max_file_size => {}
                _ => continue,
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(RawMatch {
                        path: entry.path().to_path_buf(),
                        line: idx + 1,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl TextSearch for RegexWalkSearch {
    fn name(&self) -> &'static str {
        "regex"
    }

    async fn search(&self, req: &SearchRequest) -> Result<Vec<RawMatch>, SearchUnavailable> {
        let req = req.clone();
        tokio::task::spawn_blocking(move || Self::search_blocking(&req))
            .await
            .map_err(|e| SearchUnavailable {
                strategy: "regex",
                reason: e.to_string(),
            })?
    }
}

/// Run strategies in order until one is available.
pub async fn search_with_fallback(
    strategies: &[std::sync::Arc<dyn TextSearch>],
    req: &SearchRequest,
) -> Result<Vec<RawMatch>, SearchUnavailable> {
    let mut last = SearchUnavailable {
        strategy: "none",
        reason: "no search strategy configured".to_string(),
    };
    for strategy in strategies {
        match strategy.search(req).await {
            Ok(matches) => {
                debug!("{} search found {} matches", strategy.name(), matches.len());
                return Ok(matches);
            }
            Err(e) => {
                debug!("Falling back from {}", e);
                last = e;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    fn request(base: &Path, pattern: &str, include: Option<&str>) -> SearchRequest {
        SearchRequest {
            pattern: pattern.to_string(),
            base: base.to_path_buf(),
            include: include.map(str::to_string),
            max_file_size: 10 * 1024 * 1024,
        }
    }

    #[test]
    fn test_parse_rg_json() {
        let stdout = concat!(
            r#"{"type":"begin","data":{"path":{"text":"/r/a.py"}}}"#,
            "\n",
            r#"{"type":"match","data":{"path":{"text":"/r/a.py"},"lines":{"text":"import os\n"},"line_number":3,"absolute_offset":10,"submatches":[]}}"#,
            "\n",
            r#"{"type":"end","data":{"path":{"text":"/r/a.py"}}}"#,
        );
        let matches = parse_rg_json(stdout);
        assert_eq!(
            matches,
            vec![RawMatch {
                path: PathBuf::from("/r/a.py"),
                line: 3,
                text: "import os".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_regex_walk_search() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("pkg")).unwrap();
        std::fs::write(tmp.path().join("pkg/a.py"), "x = 1\nneedle = 2\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "needle\n").unwrap();

        let all = RegexWalkSearch.search(&request(tmp.path(), "needle", None)).await.unwrap();
        assert_eq!(all.len(), 2);

        let py = RegexWalkSearch
            .search(&request(tmp.path(), "needle", Some("*.{py,pyi}")))
            .await
            .unwrap();
        assert_eq!(py.len(), 1);
        assert_eq!(py[0].line, 2);
    }

    #[tokio::test]
    async fn test_regex_walk_skips_large_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("big.txt"), "needle\n".repeat(100)).unwrap();
        let mut req = request(tmp.path(), "needle", None);
        req.max_file_size = 10;
        assert!(RegexWalkSearch.search(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_when_binary_missing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "needle\n").unwrap();

        let strategies: Vec<Arc<dyn TextSearch>> = vec![
            Arc::new(RipgrepSearch::new("/nonexistent/rg", DEFAULT_SEARCH_TIMEOUT)),
            Arc::new(RegexWalkSearch),
        ];
        let matches = search_with_fallback(&strategies, &request(tmp.path(), "needle", None))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }
}
