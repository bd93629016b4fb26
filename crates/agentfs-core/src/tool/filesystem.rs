use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    optional_bool, optional_str, optional_usize, required_str, EvictionGuard, Tool, ToolOutput,
    ToolRegistry,
};
use crate::backend::Backend;
use crate::error::{BackendError, ToolError};
use crate::types::{CallContext, OutputMode};
use crate::util::content::{DEFAULT_READ_LIMIT, TOOL_RESULT_TOKEN_LIMIT};
use crate::util::pattern::is_valid_include_pattern;
use crate::util::{truncate_if_too_long, validate_and_normalize};

const LS_DESCRIPTION: &str = "Lists the direct children of a directory in the filesystem.

Usage:
- path defaults to the root directory /.
- Directories are listed with a trailing /. Call ls again on one to look inside it.
- Use this tool to explore before reading or editing files.";

const READ_FILE_DESCRIPTION: &str = "Reads a file from the filesystem.

Usage:
- file_path must be an absolute path starting with /.
- Up to 2000 lines are returned from the start of the file by default. Use offset (lines to skip) and limit to page through long files.
- Lines longer than 2000 characters are cut.
- Output is numbered like cat -n, starting at 1.
- Reading a file that exists but is empty returns a system reminder instead of contents.
- Always read a file before editing it.";

const WRITE_FILE_DESCRIPTION: &str = "Creates a new file in the filesystem.

Usage:
- file_path must be an absolute path starting with /.
- Writing to a path that already exists fails. Read the file and use edit_file instead.
- Prefer editing existing files over creating new ones.";

const EDIT_FILE_DESCRIPTION: &str = "Performs an exact string replacement in an existing file.

Usage:
- Read the file first. Copy old_string from the read output without the line-number prefix (spaces, number, tab) and keep its exact indentation.
- The edit fails if old_string is not found, or if it appears more than once and replace_all is false. Add surrounding context to make it unique.
- Set replace_all to true to rename or replace every occurrence.";

const GLOB_DESCRIPTION: &str = "Finds files whose path matches a glob pattern.

Usage:
- Patterns are relative to path (default /): *.py matches only direct children, **/*.py matches at any depth.
- Braces expand to alternatives, e.g. **/*.{ts,tsx}.
- Returns matching absolute paths, one per line.";

const GREP_DESCRIPTION: &str = "Searches file contents with a regular expression.

Usage:
- path limits the search to a directory (default /).
- glob filters files by name, e.g. *.py or *.{js,ts}.
- output_mode is files_with_matches (default, one path per line), content (path:line:text) or count (path:number of matches).
- An invalid regex returns an error message describing the problem.";

const EXECUTE_DESCRIPTION: &str = "Runs a shell command in the sandbox and returns its combined output.

Usage:
- timeout is in seconds and defaults to the sandbox command timeout.
- A non-zero exit status is reported after the output.";

const LS_LONG_TERM: &str = "\n- Files in the long-term filesystem are listed under {prefix}.";
const READ_FILE_LONG_TERM: &str = "\n- Paths under {prefix} are read from the long-term filesystem.";
const WRITE_FILE_LONG_TERM: &str = "\n- Paths under {prefix} are written to the long-term filesystem and persist across conversations.";
const EDIT_FILE_LONG_TERM: &str = "\n- Files under {prefix} live in the long-term filesystem and can be edited the same way.";

const SYSTEM_PROMPT: &str = "## Filesystem Tools

You have access to a filesystem through these tools. All file paths must start with a /.

- ls: list the contents of a directory
- read_file: read a file, optionally a range of lines
- write_file: create a new file
- edit_file: replace text in an existing file";

const SYSTEM_PROMPT_SEARCH: &str = "
- glob: find files by path pattern
- grep: search file contents with a regular expression";

const SYSTEM_PROMPT_EXECUTE: &str = "
- execute: run a shell command in the sandbox";

const SYSTEM_PROMPT_LONG_TERM: &str = "

Files under {prefix} are kept in a long-term filesystem that outlives this conversation. Use the same tools with paths starting with {prefix} to store anything worth remembering.";

/// Settings for the generated filesystem tools.
#[derive(Debug, Clone)]
pub struct ToolOptions {
    /// Per-tool description overrides keyed by tool name.
    pub custom_descriptions: HashMap<String, String>,
    /// When set, every path must start with one of these.
    pub allowed_prefixes: Option<Vec<String>>,
    /// Results larger than this many tokens are evicted. `None` disables eviction.
    pub token_limit_before_evict: Option<usize>,
    /// Route prefix of the long-term store, mentioned in descriptions.
    pub long_term_prefix: Option<String>,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            custom_descriptions: HashMap::new(),
            allowed_prefixes: None,
            token_limit_before_evict: Some(TOOL_RESULT_TOKEN_LIMIT),
            long_term_prefix: None,
        }
    }
}

/// Backend plus path policy shared by every generated tool.
struct ToolEnv {
    backend: Arc<dyn Backend>,
    allowed_prefixes: Option<Vec<String>>,
}

impl ToolEnv {
    fn path(&self, path: &str) -> Result<String, ToolError> {
        validate_and_normalize(path, self.allowed_prefixes.as_deref())
            .map_err(|e| ToolError::Backend(BackendError::InvalidPath(e)))
    }
}

fn render(result: Result<ToolOutput, ToolError>) -> ToolOutput {
    result.unwrap_or_else(|e| ToolOutput::text(format!("Error: {e}")))
}

// ====== LsTool ======

pub struct LsTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl LsTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let path = self.env.path(optional_str(params, "path")?.unwrap_or("/"))?;
        let infos = self.env.backend.ls(ctx, &path).await?;
        if infos.is_empty() {
            return Ok(ToolOutput::text(format!("No files found in {path}")));
        }
        let paths: Vec<String> = infos.into_iter().map(|i| i.path).collect();
        Ok(ToolOutput::text(truncate_if_too_long(paths).join("\n")))
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute directory path to list (default /)"
                }
            }
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== ReadFileTool ======

pub struct ReadFileTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl ReadFileTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let path = self.env.path(required_str(params, "file_path")?)?;
        let offset = optional_usize(params, "offset", 0)?;
        let limit = optional_usize(params, "limit", DEFAULT_READ_LIMIT)?;
        let content = self.env.backend.read(ctx, &path, offset, limit).await?;
        Ok(ToolOutput::text(content))
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to read"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Number of lines to skip (default 0)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["file_path"]
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== WriteFileTool ======

pub struct WriteFileTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl WriteFileTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let path = self.env.path(required_str(params, "file_path")?)?;
        let content = required_str(params, "content")?;
        let res = self.env.backend.write(ctx, &path, content).await?;
        if let Some(error) = res.error {
            return Ok(ToolOutput::text(error));
        }
        Ok(ToolOutput::with_update(
            format!("Updated file {path}"),
            res.files_update,
        ))
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the new file"
                },
                "content": {
                    "type": "string",
                    "description": "Full content of the file"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== EditFileTool ======

pub struct EditFileTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl EditFileTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let path = self.env.path(required_str(params, "file_path")?)?;
        let old = required_str(params, "old_string")?;
        let new = required_str(params, "new_string")?;
        let replace_all = optional_bool(params, "replace_all")?;

        let res = self.env.backend.edit(ctx, &path, old, new, replace_all).await?;
        if let Some(error) = res.error {
            return Ok(ToolOutput::text(error));
        }
        let n = res.occurrences.unwrap_or(1);
        Ok(ToolOutput::with_update(
            format!("Successfully replaced {n} instance(s) of the string in '{path}'"),
            res.files_update,
        ))
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== GlobTool ======

pub struct GlobTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl GlobTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let pattern = required_str(params, "pattern")?;
        let path = self.env.path(optional_str(params, "path")?.unwrap_or("/"))?;
        let paths = self.env.backend.glob(ctx, pattern, &path).await?;
        if paths.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No files found matching pattern: '{pattern}'"
            )));
        }
        Ok(ToolOutput::text(paths.join("\n")))
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. **/*.py"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search from (default /)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== GrepTool ======

pub struct GrepTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl GrepTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let pattern = required_str(params, "pattern")?;
        let path = self.env.path(optional_str(params, "path")?.unwrap_or("/"))?;
        let include = optional_str(params, "glob")?;
        if let Some(glob) = include.filter(|g| !is_valid_include_pattern(g)) {
            return Err(ToolError::InvalidParams(format!(
                "'glob' is not a valid file pattern: '{glob}'"
            )));
        }
        let mode = match optional_str(params, "output_mode")? {
            None => OutputMode::default(),
            Some(raw) => OutputMode::parse(raw).ok_or_else(|| {
                ToolError::InvalidParams(format!(
                    "'output_mode' must be one of files_with_matches, content, count (got '{raw}')"
                ))
            })?,
        };
        let out = self
            .env
            .backend
            .grep(ctx, pattern, Some(&path), include, mode)
            .await?;
        Ok(ToolOutput::text(out))
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search (default /)"
                },
                "glob": {
                    "type": "string",
                    "description": "File name filter, e.g. *.py or *.{ts,tsx}"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["files_with_matches", "content", "count"],
                    "description": "How to report matches (default files_with_matches)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn evictable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== ExecuteTool ======

pub struct ExecuteTool {
    env: Arc<ToolEnv>,
    description: String,
}

impl ExecuteTool {
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolOutput, ToolError> {
        let command = required_str(params, "command")?;
        let timeout = match params.get("timeout") {
            None | Some(serde_json::Value::Null) => None,
            Some(_) => Some(Duration::from_secs(optional_usize(params, "timeout", 0)? as u64)),
        };

        let resp = self.env.backend.execute(ctx, command, timeout).await?;
        let mut parts = Vec::new();
        if !resp.output.is_empty() {
            parts.push(resp.output);
        }
        if resp.truncated {
            parts.push("[Output was truncated]".to_string());
        }
        match resp.exit_code {
            Some(0) | None => {}
            Some(code) => parts.push(format!("Exit code: {code}")),
        }
        if parts.is_empty() {
            return Ok(ToolOutput::text("(no output)"));
        }
        Ok(ToolOutput::text(parts.join("\n")))
    }
}

#[async_trait]
impl Tool for ExecuteTool {
    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, ctx: &CallContext<'_>, params: HashMap<String, serde_json::Value>) -> ToolOutput {
        render(self.run(ctx, &params).await)
    }
}

// ====== FilesystemToolkit ======

/// Builds the agent-facing tools for one backend.
pub struct FilesystemToolkit {
    backend: Arc<dyn Backend>,
    options: ToolOptions,
}

impl FilesystemToolkit {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            options: ToolOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ToolOptions) -> Self {
        self.options = options;
        self
    }

    fn description(&self, name: &str, default: &str, long_term: Option<&str>) -> String {
        if let Some(custom) = self.options.custom_descriptions.get(name) {
            return custom.clone();
        }
        match (&self.options.long_term_prefix, long_term) {
            (Some(prefix), Some(supplement)) => {
                format!("{default}{}", supplement.replace("{prefix}", prefix))
            }
            _ => default.to_string(),
        }
    }

    /// One tool per operation the backend supports.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let env = Arc::new(ToolEnv {
            backend: self.backend.clone(),
            allowed_prefixes: self.options.allowed_prefixes.clone(),
        });
        let caps = self.backend.capabilities();
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

        if caps.can_list {
            tools.push(Arc::new(LsTool {
                env: env.clone(),
                description: self.description("ls", LS_DESCRIPTION, Some(LS_LONG_TERM)),
            }));
        }
        if caps.can_read {
            tools.push(Arc::new(ReadFileTool {
                env: env.clone(),
                description: self.description("read_file", READ_FILE_DESCRIPTION, Some(READ_FILE_LONG_TERM)),
            }));
        }
        if caps.can_write {
            tools.push(Arc::new(WriteFileTool {
                env: env.clone(),
                description: self.description("write_file", WRITE_FILE_DESCRIPTION, Some(WRITE_FILE_LONG_TERM)),
            }));
        }
        if caps.can_edit {
            tools.push(Arc::new(EditFileTool {
                env: env.clone(),
                description: self.description("edit_file", EDIT_FILE_DESCRIPTION, Some(EDIT_FILE_LONG_TERM)),
            }));
        }
        if caps.can_glob {
            tools.push(Arc::new(GlobTool {
                env: env.clone(),
                description: self.description("glob", GLOB_DESCRIPTION, None),
            }));
        }
        if caps.can_grep {
            tools.push(Arc::new(GrepTool {
                env: env.clone(),
                description: self.description("grep", GREP_DESCRIPTION, None),
            }));
        }
        if caps.can_execute {
            tools.push(Arc::new(ExecuteTool {
                env,
                description: self.description("execute", EXECUTE_DESCRIPTION, None),
            }));
        }
        tools
    }

    /// Prompt fragment describing the filesystem to the model.
    pub fn system_prompt(&self) -> String {
        let caps = self.backend.capabilities();
        let mut prompt = SYSTEM_PROMPT.to_string();
        if caps.can_glob || caps.can_grep {
            prompt.push_str(SYSTEM_PROMPT_SEARCH);
        }
        if caps.can_execute {
            prompt.push_str(SYSTEM_PROMPT_EXECUTE);
        }
        if let Some(prefix) = &self.options.long_term_prefix {
            prompt.push_str(&SYSTEM_PROMPT_LONG_TERM.replace("{prefix}", prefix));
        }
        prompt
    }

    /// Register every tool, with eviction when a token limit is configured.
    pub fn into_registry(self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        if let Some(limit) = self.options.token_limit_before_evict {
            registry = registry.with_eviction(EvictionGuard::new(self.backend.clone(), limit));
        }
        for tool in self.tools() {
            registry.register(tool);
        }
        registry
    }
}
