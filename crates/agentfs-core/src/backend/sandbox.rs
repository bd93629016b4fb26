use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::search::relative_to;
use super::{Backend, BackendResult};
use crate::error::{BackendError, SandboxError};
use crate::sandbox::{SandboxClient, DEFAULT_COMMAND_TIMEOUT};
use crate::types::{
    not_found, CallContext, Capabilities, EditResult, ExecuteResponse, FileInfo, GrepMatch,
    StorageModel, WriteResult,
};
use crate::util::content::EMPTY_CONTENT_WARNING;
use crate::util::pattern::{build_glob_set, compile_regex, expand_braces};
use crate::util::{format_with_line_numbers, iso_from_epoch_secs, perform_replacement, shell_quote};

// Exit statuses of the generated read script.
const READ_NOT_FOUND: i32 = 3;
const READ_EMPTY: i32 = 4;
const READ_OFFSET_PAST_END: i32 = 5;

/// Backend that drives a remote sandbox through shell commands and file transfer.
pub struct SandboxBackend {
    client: Arc<dyn SandboxClient>,
    command_timeout: Duration,
}

impl SandboxBackend {
    pub fn new(client: Arc<dyn SandboxClient>) -> Self {
        Self {
            client,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run(&self, command: &str) -> BackendResult<ExecuteResponse> {
        debug!("sandbox {}: {}", self.client.id(), command);
        Ok(self.client.execute(command, self.command_timeout).await?)
    }
}

fn ls_command(path: &str) -> String {
    format!(
        "find {} -maxdepth 1 -mindepth 1 -printf '%p\\t%s\\t%T@\\t%y\\n' 2>/dev/null",
        shell_quote(path)
    )
}

fn read_command(path: &str, offset: usize, limit: usize) -> String {
    let p = shell_quote(path);
    format!(
        "if [ ! -f {p} ]; then exit {READ_NOT_FOUND}; fi; \
         if ! grep -q '[^[:space:]]' {p}; then exit {READ_EMPTY}; fi; \
         awk -v s={offset} -v l={limit} \
         'NR > s && NR <= s + l {{ print }} END {{ if (NR <= s) {{ print NR; exit {READ_OFFSET_PAST_END} }} }}' {p}"
    )
}

fn grep_command(pattern: &str, path: &str, includes: &[String]) -> String {
    let mut cmd = String::from("grep -rHnE");
    for include in includes {
        cmd.push_str(&format!(" --include={}", shell_quote(include)));
    }
    cmd.push_str(&format!(
        " -e {} {} 2>/dev/null",
        shell_quote(pattern),
        shell_quote(path)
    ));
    cmd
}

fn glob_command(path: &str) -> String {
    format!(
        "find {} -type f -printf '%p\\t%s\\t%T@\\n' 2>/dev/null",
        shell_quote(path)
    )
}

/// Parse `find -printf '%p\t%s\t%T@\t%y\n'` output.
fn parse_listing(output: &str) -> Vec<FileInfo> {
    let mut infos: Vec<FileInfo> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '\t');
            let path = parts.next()?;
            let size = parts.next()?.parse::<u64>().ok();
            let mtime = parts.next()?.parse::<f64>().ok().and_then(iso_from_epoch_secs);
            let kind = parts.next().unwrap_or("f");
            if path.is_empty() {
                return None;
            }
            Some(if kind == "d" {
                FileInfo::dir(path)
            } else {
                FileInfo::file(path, size.unwrap_or(0), mtime)
            })
        })
        .collect();
    infos.sort_by(|a, b| a.path.cmp(&b.path));
    infos
}

/// Parse `grep -Hn` output of the form `path:line:text`.
fn parse_grep_output(output: &str) -> Vec<GrepMatch> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let path = parts.next()?;
            let line_no = parts.next()?.parse::<usize>().ok()?;
            let text = parts.next().unwrap_or("");
            Some(GrepMatch {
                path: path.to_string(),
                line: line_no,
                text: text.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl Backend for SandboxBackend {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn storage_model(&self) -> StorageModel {
        StorageModel::External
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES.with_execute()
    }

    async fn ls(&self, _ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>> {
        let resp = self.run(&ls_command(path)).await?;
        Ok(parse_listing(&resp.output))
    }

    async fn read(
        &self,
        _ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String> {
        let resp = self.run(&read_command(path, offset, limit)).await?;
        match resp.exit_code {
            Some(0) => {
                let body = resp.output.strip_suffix('\n').unwrap_or(&resp.output);
                let lines: Vec<&str> = body.split('\n').collect();
                Ok(format_with_line_numbers(&lines, offset + 1))
            }
            Some(READ_NOT_FOUND) => Ok(not_found(path)),
            Some(READ_EMPTY) => Ok(EMPTY_CONTENT_WARNING.to_string()),
            Some(READ_OFFSET_PAST_END) => {
                let total = resp.output.trim().parse::<usize>().unwrap_or(0);
                Ok(format!(
                    "Error: Line offset {offset} exceeds file length ({total} lines)"
                ))
            }
            code => Err(BackendError::Unavailable(format!(
                "read of {path} failed with exit status {code:?}: {}",
                resp.output.trim()
            ))),
        }
    }

    async fn write(&self, _ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult> {
        let check = self.run(&format!("test -e {}", shell_quote(path))).await?;
        match check.exit_code {
            Some(0) => return Ok(WriteResult::already_exists(path)),
            Some(1) => {}
            code => {
                return Err(BackendError::Unavailable(format!(
                    "existence check for {path} failed with exit status {code:?}: {}",
                    check.output.trim()
                )))
            }
        }
        self.client.upload_file(path, content.as_bytes()).await?;
        Ok(WriteResult::ok(path, None))
    }

    async fn edit(
        &self,
        _ctx: &CallContext<'_>,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> BackendResult<EditResult> {
        let bytes = match self.client.download_file(path).await {
            Ok(bytes) => bytes,
            Err(SandboxError::NotFound(_)) => return Ok(EditResult::err(not_found(path))),
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8_lossy(&bytes);
        match perform_replacement(&content, old, new, replace_all) {
            Ok((updated, occurrences)) => {
                self.client.upload_file(path, updated.as_bytes()).await?;
                Ok(EditResult::ok(path, occurrences, None))
            }
            Err(msg) => Ok(EditResult::err(msg)),
        }
    }

    async fn grep_raw(
        &self,
        _ctx: &CallContext<'_>,
        pattern: &str,
        path: Option<&str>,
        include: Option<&str>,
    ) -> BackendResult<Vec<GrepMatch>> {
        compile_regex(pattern)?;
        let includes = match include {
            Some(glob) => expand_braces(glob).map_err(|e| {
                BackendError::InvalidPattern(format!("Invalid include pattern: {e}"))
            })?,
            None => Vec::new(),
        };
        let resp = self
            .run(&grep_command(pattern, path.unwrap_or("/"), &includes))
            .await?;
        let mut matches = parse_grep_output(&resp.output);
        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        Ok(matches)
    }

    async fn glob_info(&self, _ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>> {
        let set = build_glob_set(pattern.trim_start_matches('/'))
            .map_err(|e| BackendError::InvalidPattern(format!("Invalid glob pattern: {e}")))?;
        let resp = self.run(&glob_command(path)).await?;
        Ok(parse_listing(&resp.output)
            .into_iter()
            .filter(|info| relative_to(&info.path, path).is_some_and(|rel| set.is_match(rel)))
            .collect())
    }

    async fn execute(
        &self,
        _ctx: &CallContext<'_>,
        command: &str,
        timeout: Option<Duration>,
    ) -> BackendResult<ExecuteResponse> {
        let timeout = timeout.unwrap_or(self.command_timeout);
        Ok(self.client.execute(command, timeout).await?)
    }
}
