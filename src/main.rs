use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use agentfs_core::backend::Backend;
use agentfs_core::config::{self, Config};
use agentfs_core::record::{merge_files, FileState};
use agentfs_core::tool::{FilesystemToolkit, ToolRegistry};
use agentfs_core::types::CallContext;

#[derive(Parser)]
#[command(
    name = "agentfs",
    about = "Virtual filesystem tools for AI coding agents",
    version = agentfs_core::VERSION,
)]
struct Cli {
    /// Config file; must exist when given (default: ~/.agentfs/config.json, overlaid with AGENTFS_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON file holding the conversation file state
    #[arg(long, global = true, default_value = ".agentfs-state.json")]
    state: PathBuf,
    /// Assistant id used to namespace the persistent store
    #[arg(long, global = true)]
    assistant: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Read a file with line numbers
    Read {
        path: String,
        /// Lines to skip
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Lines to return
        #[arg(long, default_value_t = 2000)]
        limit: u64,
    },
    /// Create a new file (content from the argument or stdin)
    Write {
        path: String,
        content: Option<String>,
    },
    /// Replace a string in a file
    Edit {
        path: String,
        old: String,
        new: String,
        #[arg(long)]
        replace_all: bool,
    },
    /// Search file contents with a regex
    Grep {
        pattern: String,
        #[arg(long)]
        path: Option<String>,
        /// File name filter, e.g. '*.{rs,toml}'
        #[arg(long)]
        glob: Option<String>,
        /// files_with_matches, content or count
        #[arg(long)]
        mode: Option<String>,
    },
    /// Find files by glob pattern
    Glob {
        pattern: String,
        #[arg(long)]
        path: Option<String>,
    },
    /// Run a shell command in the sandbox
    Exec {
        command: Vec<String>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print tool definitions and the system prompt
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentfs=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::read_config(path).context("failed to load config")?,
        None => config::load_config_from_env(),
    };

    let backend = config::build_backend(&cfg).context("failed to build backend")?;
    tracing::debug!("Using {} backend ({:?})", backend.name(), backend.storage_model());
    let toolkit = FilesystemToolkit::new(backend).with_options(cfg.tool_options());

    if let Commands::Tools = cli.command {
        return cmd_tools(&toolkit);
    }

    let (name, params) = tool_call(cli.command)?;
    tracing::debug!("Running {} tool", name);
    let registry = toolkit.into_registry();
    run_tool(&registry, &cfg, &cli.state, cli.assistant.as_deref(), &name, params).await
}

// ====== Commands ======

/// Translate a subcommand into the tool call an agent would make.
fn tool_call(command: Commands) -> Result<(String, HashMap<String, Value>)> {
    let (name, params) = match command {
        Commands::Ls { path } => ("ls", json!({ "path": path })),
        Commands::Read { path, offset, limit } => (
            "read_file",
            json!({ "file_path": path, "offset": offset, "limit": limit }),
        ),
        Commands::Write { path, content } => {
            let content = match content {
                Some(c) => c,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read content from stdin")?;
                    buf
                }
            };
            ("write_file", json!({ "file_path": path, "content": content }))
        }
        Commands::Edit { path, old, new, replace_all } => (
            "edit_file",
            json!({
                "file_path": path,
                "old_string": old,
                "new_string": new,
                "replace_all": replace_all,
            }),
        ),
        Commands::Grep { pattern, path, glob, mode } => (
            "grep",
            json!({ "pattern": pattern, "path": path, "glob": glob, "output_mode": mode }),
        ),
        Commands::Glob { pattern, path } => ("glob", json!({ "pattern": pattern, "path": path })),
        Commands::Exec { command, timeout } => (
            "execute",
            json!({ "command": command.join(" "), "timeout": timeout }),
        ),
        Commands::Tools => anyhow::bail!("tools is not a tool call"),
    };

    let params = match params {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => HashMap::new(),
    };
    Ok((name.to_string(), params))
}

async fn run_tool(
    registry: &ToolRegistry,
    cfg: &Config,
    state_path: &Path,
    assistant: Option<&str>,
    name: &str,
    params: HashMap<String, Value>,
) -> Result<()> {
    let mut files = load_state(state_path)?;
    let call_id = format!("cli_{}", uuid::Uuid::new_v4().simple());
    let assistant = assistant.or(cfg.store.assistant_id.as_deref());

    let output = {
        let mut ctx = CallContext::new().with_files(&files).with_tool_call(&call_id);
        if let Some(id) = assistant {
            ctx = ctx.with_assistant(id);
        }
        registry.execute(name, &ctx, params).await
    };

    println!("{}", output.content);

    if let Some(update) = output.files_update {
        merge_files(&mut files, update);
        save_state(state_path, &files)?;
    }
    Ok(())
}

fn cmd_tools(toolkit: &FilesystemToolkit) -> Result<()> {
    let registry = ToolRegistry::new();
    for tool in toolkit.tools() {
        registry.register(tool);
    }
    println!("{}", serde_json::to_string_pretty(&registry.get_definitions())?);
    println!();
    println!("{}", toolkit.system_prompt());
    Ok(())
}

// ====== State file ======

fn load_state(path: &Path) -> Result<FileState> {
    if !path.exists() {
        return Ok(FileState::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(FileState::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state file {}", path.display()))
}

fn save_state(path: &Path, files: &FileState) -> Result<()> {
    let json = serde_json::to_string_pretty(files)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write state file {}", path.display()))?;
    Ok(())
}
