use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::filesystem::searchers_for;
use crate::backend::{Backend, CompositeBackend, FilesystemBackend, SandboxBackend, StateBackend, StoreBackend};
use crate::error::{ConfigError, Result};
use crate::sandbox::{HttpSandboxClient, LocalProcessClient, SandboxClient};
use crate::store::{JsonFileStore, KvStore};
use crate::tool::ToolOptions;
use crate::util::content::TOOL_RESULT_TOKEN_LIMIT;

/// Sandbox endpoint value that runs commands on this machine instead.
pub const LOCAL_SANDBOX_ENDPOINT: &str = "local";

/// Root configuration for agentfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub default_backend: BackendKind,
    /// Path prefix to backend kind.
    pub routes: BTreeMap<String, BackendKind>,
    pub filesystem: FilesystemConfig,
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut routes = BTreeMap::new();
        routes.insert("/memories/".to_string(), BackendKind::Store);
        Self {
            default_backend: BackendKind::State,
            routes,
            filesystem: FilesystemConfig::default(),
            store: StoreConfig::default(),
            sandbox: SandboxConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    /// First route served by the persistent store, if any.
    pub fn long_term_prefix(&self) -> Option<&str> {
        self.routes
            .iter()
            .find(|(_, kind)| **kind == BackendKind::Store)
            .map(|(prefix, _)| prefix.as_str())
    }

    pub fn tool_options(&self) -> ToolOptions {
        ToolOptions {
            custom_descriptions: self.tools.custom_descriptions.clone(),
            allowed_prefixes: self.tools.allowed_prefixes.clone(),
            token_limit_before_evict: self.tools.token_limit_before_evict,
            long_term_prefix: self.long_term_prefix().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    State,
    Store,
    Filesystem,
    Sandbox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilesystemConfig {
    pub root_dir: String,
    pub virtual_mode: bool,
    pub max_file_size_mb: u64,
    pub use_ripgrep: bool,
    pub search_timeout_secs: u64,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root_dir: ".".to_string(),
            virtual_mode: true,
            max_file_size_mb: 10,
            use_ripgrep: true,
            search_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub dir: String,
    pub page_size: usize,
    pub assistant_id: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: "~/.agentfs/store".to_string(),
            page_size: 100,
            assistant_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// JSON-RPC endpoint, or `local` for a shell on this machine.
    pub endpoint: String,
    pub api_key: String,
    pub command_timeout_secs: u64,
    pub working_dir: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            command_timeout_secs: 1800,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// `null` disables eviction.
    pub token_limit_before_evict: Option<usize>,
    pub allowed_prefixes: Option<Vec<String>>,
    pub custom_descriptions: HashMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            token_limit_before_evict: Some(TOOL_RESULT_TOKEN_LIMIT),
            allowed_prefixes: None,
            custom_descriptions: HashMap::new(),
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path.starts_with("~\\") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

/// Build the backend described by `config`: the default backend, wrapped in
/// a router when any routes are configured. All store-backed routes share
/// one store.
pub fn build_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    let mut store: Option<Arc<dyn KvStore>> = None;
    let default = build_kind(config, config.default_backend, &mut store)?;
    if config.routes.is_empty() {
        return Ok(default);
    }

    let mut routes = Vec::with_capacity(config.routes.len());
    for (prefix, kind) in &config.routes {
        routes.push((prefix.as_str(), build_kind(config, *kind, &mut store)?));
    }
    Ok(Arc::new(CompositeBackend::new(default, routes)))
}

fn build_kind(
    config: &Config,
    kind: BackendKind,
    store: &mut Option<Arc<dyn KvStore>>,
) -> std::result::Result<Arc<dyn Backend>, ConfigError> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::State => Arc::new(StateBackend::new()),
        BackendKind::Store => {
            let shared = store
                .get_or_insert_with(|| {
                    let dir = expand_home(&config.store.dir);
                    info!("Using store at {}", dir.display());
                    let store: Arc<dyn KvStore> = Arc::new(JsonFileStore::new(dir));
                    store
                })
                .clone();
            Arc::new(StoreBackend::new(shared).with_page_size(config.store.page_size))
        }
        BackendKind::Filesystem => {
            let fs = &config.filesystem;
            let root = expand_home(&fs.root_dir);
            info!("Using filesystem root {} (virtual mode: {})", root.display(), fs.virtual_mode);
            Arc::new(
                FilesystemBackend::new(root)
                    .with_virtual_mode(fs.virtual_mode)
                    .with_max_file_size_mb(fs.max_file_size_mb)
                    .with_searchers(searchers_for(
                        fs.use_ripgrep,
                        Duration::from_secs(fs.search_timeout_secs),
                    )),
            )
        }
        BackendKind::Sandbox => {
            let sb = &config.sandbox;
            let client: Arc<dyn SandboxClient> = match sb.endpoint.as_str() {
                "" => {
                    return Err(ConfigError::Invalid(
                        "sandbox backend requires sandbox.endpoint".to_string(),
                    ))
                }
                LOCAL_SANDBOX_ENDPOINT => {
                    let dir = sb.working_dir.as_deref().map(expand_home).unwrap_or_else(|| PathBuf::from("."));
                    Arc::new(LocalProcessClient::new(dir))
                }
                endpoint => {
                    let api_key = (!sb.api_key.is_empty()).then(|| sb.api_key.clone());
                    Arc::new(HttpSandboxClient::new(endpoint, api_key))
                }
            };
            info!("Using sandbox {}", client.id());
            Arc::new(
                SandboxBackend::new(client)
                    .with_command_timeout(Duration::from_secs(sb.command_timeout_secs)),
            )
        }
    };
    Ok(backend)
}

/// Load config from environment variables (for containerized deployments).
///
/// `AGENTFS_CONFIG` may hold the whole config as JSON. Otherwise the config
/// file is loaded and individual variables are overlaid on it.
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("AGENTFS_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(cfg) => return cfg,
            Err(e) => tracing::warn!("Failed to parse AGENTFS_CONFIG: {}", e),
        }
    }

    let mut cfg = load_config(None);
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

fn apply_env_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("AGENTFS_ROOT") {
        cfg.filesystem.root_dir = v;
    }
    if let Some(v) = var("AGENTFS_STORE_DIR") {
        cfg.store.dir = v;
    }
    if let Some(v) = var("AGENTFS_ASSISTANT_ID") {
        cfg.store.assistant_id = Some(v).filter(|s| !s.is_empty());
    }
    if let Some(v) = var("AGENTFS_SANDBOX_ENDPOINT") {
        cfg.sandbox.endpoint = v;
    }
    if let Some(v) = var("AGENTFS_SANDBOX_API_KEY") {
        cfg.sandbox.api_key = v;
    }
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentfs")
        .join("config.json")
}

/// Read a config file, failing when it is missing or malformed.
pub fn read_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()).into());
    }
    let content = std::fs::read_to_string(path)?;
    let config = serde_json::from_str::<Config>(&content).map_err(ConfigError::from)?;
    Ok(config)
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        return Config::default();
    }
    match read_config(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config from {}: {}", path.display(), e);
            tracing::warn!("Using default configuration.");
            Config::default()
        }
    }
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(ConfigError::from)?;
    std::fs::write(&path, json)?;
    Ok(())
}
