pub mod eviction;
pub mod filesystem;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ToolError;
use crate::record::{combine_updates, FilesUpdate};
use crate::types::CallContext;

pub use eviction::{EvictionGuard, TOO_LARGE_TOOL_MSG};
pub use filesystem::{FilesystemToolkit, ToolOptions};

/// What a tool hands back to the agent loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Text shown to the model.
    pub content: String,
    /// State patch for the caller to merge, from checkpoint backends.
    pub files_update: Option<FilesUpdate>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            files_update: None,
        }
    }

    pub fn with_update(content: impl Into<String>, files_update: Option<FilesUpdate>) -> Self {
        Self {
            content: content.into(),
            files_update,
        }
    }

    /// Fold another pending patch into this output.
    pub fn merge_update(&mut self, update: Option<FilesUpdate>) {
        self.files_update = match (self.files_update.take(), update) {
            (Some(left), Some(right)) => Some(combine_updates(left, right)),
            (left, right) => left.or(right),
        };
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

/// Trait for agent tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used in function calls.
    fn name(&self) -> &str;

    /// Description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for tool parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Whether oversized results may be moved to the filesystem.
    fn evictable(&self) -> bool {
        true
    }

    /// Execute the tool with given parameters.
    async fn execute(
        &self,
        ctx: &CallContext<'_>,
        params: HashMap<String, serde_json::Value>,
    ) -> ToolOutput;
}

/// Extension trait for Tool to convert to OpenAI function schema.
pub trait ToolSchema: Tool {
    fn to_schema(&self) -> serde_json::Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

impl<T: Tool + ?Sized> ToolSchema for T {}

/// Lock-free tool registry using DashMap.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    eviction: Option<EvictionGuard>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            eviction: None,
        }
    }

    /// Move oversized results of evictable tools into the filesystem.
    pub fn with_eviction(mut self, guard: EvictionGuard) -> Self {
        self.eviction = Some(guard);
        self
    }

    /// Register a tool.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&self, name: &str) {
        self.tools.remove(name);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.value().clone())
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all tool definitions in OpenAI format, ordered by name.
    pub fn get_definitions(&self) -> Vec<serde_json::Value> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.iter().map(|e| e.value().clone()).collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools.iter().map(|t| t.to_schema()).collect()
    }

    /// Execute a tool by name with given parameters.
    pub async fn execute(
        &self,
        name: &str,
        ctx: &CallContext<'_>,
        params: HashMap<String, serde_json::Value>,
    ) -> ToolOutput {
        let tool = match self.tools.get(name) {
            Some(t) => t.value().clone(),
            None => return ToolOutput::text(format!("Error: Tool '{name}' not found")),
        };

        debug!("Executing tool: {}", name);
        let output = tool.execute(ctx, params).await;
        match &self.eviction {
            Some(guard) if tool.evictable() => guard.apply(ctx, output).await,
            _ => output,
        }
    }

    /// Get list of registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ====== Parameter helpers ======

pub(crate) fn required_str<'a>(
    params: &'a HashMap<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str, ToolError> {
    match params.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(_) => Err(ToolError::InvalidParams(format!("'{key}' must be a string"))),
        None => Err(ToolError::InvalidParams(format!("'{key}' parameter is required"))),
    }
}

pub(crate) fn optional_str<'a>(
    params: &'a HashMap<String, serde_json::Value>,
    key: &str,
) -> Result<Option<&'a str>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ToolError::InvalidParams(format!("'{key}' must be a string"))),
    }
}

pub(crate) fn optional_usize(
    params: &HashMap<String, serde_json::Value>,
    key: &str,
    default: usize,
) -> Result<usize, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| ToolError::InvalidParams(format!("'{key}' must be a non-negative integer"))),
    }
}

pub(crate) fn optional_bool(
    params: &HashMap<String, serde_json::Value>,
    key: &str,
) -> Result<bool, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(false),
        Some(serde_json::Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ToolError::InvalidParams(format!("'{key}' must be a boolean"))),
    }
}
