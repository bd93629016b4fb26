//! Agent-facing tools driven through the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use agentfs_core::backend::{Backend, CompositeBackend, FilesystemBackend, StateBackend, StoreBackend};
use agentfs_core::record::{merge_files, FileState};
use agentfs_core::store::{InMemoryStore, KvStore};
use agentfs_core::tool::{FilesystemToolkit, Tool, ToolOptions, ToolOutput};
use agentfs_core::types::CallContext;

fn params(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

fn memories_backend() -> Arc<dyn Backend> {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    Arc::new(CompositeBackend::new(
        Arc::new(StateBackend::new()),
        [("/memories/", Arc::new(StoreBackend::new(store)) as Arc<dyn Backend>)],
    ))
}

/// Produces a fixed-size payload.
struct DumpTool(usize);

#[async_trait]
impl Tool for DumpTool {
    fn name(&self) -> &str {
        "dump"
    }

    fn description(&self) -> &str {
        "Print a large payload"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _ctx: &CallContext<'_>, _params: HashMap<String, Value>) -> ToolOutput {
        let lines: Vec<String> = (0..self.0).map(|i| format!("row {i:05}")).collect();
        ToolOutput::text(lines.join("\n"))
    }
}

#[tokio::test]
async fn test_tools_over_composite() {
    let registry = FilesystemToolkit::new(memories_backend())
        .with_options(ToolOptions {
            long_term_prefix: Some("/memories/".into()),
            ..ToolOptions::default()
        })
        .into_registry();
    let mut files = FileState::new();

    let out = registry
        .execute(
            "write_file",
            &CallContext::new().with_files(&files),
            params(json!({ "file_path": "/draft.md", "content": "draft" })),
        )
        .await;
    assert_eq!(out.content, "Updated file /draft.md");
    merge_files(&mut files, out.files_update.unwrap());

    let out = registry
        .execute(
            "write_file",
            &CallContext::new().with_files(&files),
            params(json!({ "file_path": "/memories/prefs.md", "content": "tabs" })),
        )
        .await;
    assert_eq!(out.content, "Updated file /memories/prefs.md");
    assert!(out.files_update.is_none());

    let ctx = CallContext::new().with_files(&files);
    let listing = registry.execute("ls", &ctx, params(json!({ "path": "/" }))).await;
    assert!(listing.content.contains("/draft.md"));
    assert!(listing.content.contains("/memories/prefs.md"));

    let globbed = registry
        .execute("glob", &ctx, params(json!({ "pattern": "**/*.md" })))
        .await;
    assert!(globbed.content.contains("/draft.md"));
    assert!(globbed.content.contains("/memories/prefs.md"));

    let edited = registry
        .execute(
            "edit_file",
            &ctx,
            params(json!({ "file_path": "/memories/prefs.md", "old_string": "tabs", "new_string": "spaces" })),
        )
        .await;
    assert_eq!(
        edited.content,
        "Successfully replaced 1 instance(s) of the string in '/memories/prefs.md'"
    );

    let read = registry
        .execute("read_file", &ctx, params(json!({ "file_path": "/memories/prefs.md" })))
        .await;
    assert_eq!(read.content, "     1\tspaces");

    let missing = registry
        .execute("read_file", &ctx, params(json!({ "file_path": "/memories/nope.md" })))
        .await;
    assert_eq!(missing.content, "Error: File '/memories/nope.md' not found");
}

#[tokio::test]
async fn test_large_results_are_evicted() {
    let registry = FilesystemToolkit::new(Arc::new(StateBackend::new()))
        .with_options(ToolOptions {
            token_limit_before_evict: Some(100),
            ..ToolOptions::default()
        })
        .into_registry();
    registry.register(Arc::new(DumpTool(200)));
    let mut files = FileState::new();

    let out = {
        let ctx = CallContext::new().with_files(&files).with_tool_call("call_42");
        registry.execute("dump", &ctx, HashMap::new()).await
    };
    assert!(out.content.starts_with("Tool result too large"));
    assert!(out.content.contains("/large_tool_results/call_42"));
    assert!(out.content.contains("row 00009"));
    assert!(!out.content.contains("row 00010"));
    merge_files(&mut files, out.files_update.unwrap());

    // The full payload is readable afterwards.
    let ctx = CallContext::new().with_files(&files);
    let page = registry
        .execute(
            "read_file",
            &ctx,
            params(json!({ "file_path": "/large_tool_results/call_42", "offset": 150, "limit": 2 })),
        )
        .await;
    assert_eq!(page.content, "   151\trow 00150\n   152\trow 00151");
}

#[tokio::test]
async fn test_small_results_and_disabled_eviction() {
    let registry = FilesystemToolkit::new(Arc::new(StateBackend::new()))
        .with_options(ToolOptions {
            token_limit_before_evict: None,
            ..ToolOptions::default()
        })
        .into_registry();
    registry.register(Arc::new(DumpTool(200)));

    let files = FileState::new();
    let ctx = CallContext::new().with_files(&files).with_tool_call("call_1");
    let out = registry.execute("dump", &ctx, HashMap::new()).await;
    assert!(out.content.starts_with("row 00000"));
    assert!(out.files_update.is_none());
}

#[tokio::test]
async fn test_filesystem_tools_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(FilesystemBackend::new(tmp.path()));
    let registry = FilesystemToolkit::new(backend).into_registry();
    let ctx = CallContext::new();

    let out = registry
        .execute(
            "write_file",
            &ctx,
            params(json!({ "file_path": "/src/main.py", "content": "def main():\n    return 1\n" })),
        )
        .await;
    assert_eq!(out.content, "Updated file /src/main.py");
    assert!(tmp.path().join("src/main.py").exists());

    let again = registry
        .execute("write_file", &ctx, params(json!({ "file_path": "/src/main.py", "content": "x" })))
        .await;
    assert!(again.content.starts_with("Cannot write to /src/main.py because it already exists"));

    let grep = registry
        .execute(
            "grep",
            &ctx,
            params(json!({ "pattern": "def \\w+", "glob": "*.py", "output_mode": "content" })),
        )
        .await;
    assert_eq!(grep.content, "/src/main.py:1:def main():");

    let escape = registry
        .execute("read_file", &ctx, params(json!({ "file_path": "../etc/passwd" })))
        .await;
    assert_eq!(escape.content, "Error: Path traversal not allowed: ../etc/passwd");

    let bad_mode = registry
        .execute("grep", &ctx, params(json!({ "pattern": "x", "output_mode": "lines" })))
        .await;
    assert!(bad_mode.content.starts_with("Error:"));
}

#[tokio::test]
async fn test_traversal_rejected_for_every_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(StateBackend::new()),
        Arc::new(StoreBackend::new(store)),
        Arc::new(FilesystemBackend::new(tmp.path())),
        memories_backend(),
    ];
    let files = FileState::new();
    let ctx = CallContext::new().with_files(&files);

    for backend in backends {
        let name = backend.name();
        let registry = FilesystemToolkit::new(backend).into_registry();
        for (tool, key) in [("read_file", "file_path"), ("write_file", "file_path"), ("ls", "path")] {
            let mut call = HashMap::new();
            call.insert(key.to_string(), json!("/memories/../../etc/passwd"));
            call.insert("content".to_string(), json!("x"));
            let out = registry.execute(tool, &ctx, call).await;
            assert!(out.content.starts_with("Error: Path traversal not allowed"), "{name} {tool}: {}", out.content);
            assert!(out.files_update.is_none(), "{name} {tool}");
        }
    }
}

#[tokio::test]
async fn test_definitions_follow_capabilities() {
    let state = FilesystemToolkit::new(Arc::new(StateBackend::new())).into_registry();
    let names: Vec<String> = state
        .get_definitions()
        .iter()
        .map(|d| d["function"]["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["edit_file", "glob", "grep", "ls", "read_file", "write_file"]);

    for def in state.get_definitions() {
        assert_eq!(def["type"], "function");
        assert_eq!(def["function"]["parameters"]["type"], "object");
    }

    let out = state.execute("rm", &CallContext::new(), HashMap::new()).await;
    assert_eq!(out.content, "Error: Tool 'rm' not found");
}

#[cfg(unix)]
#[tokio::test]
async fn test_execute_tool_with_local_sandbox() {
    use agentfs_core::backend::SandboxBackend;
    use agentfs_core::sandbox::LocalProcessClient;

    let tmp = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(SandboxBackend::new(Arc::new(LocalProcessClient::new(tmp.path()))));
    let toolkit = FilesystemToolkit::new(backend);
    assert!(toolkit.system_prompt().contains("execute"));
    let registry = toolkit.into_registry();
    assert!(registry.has("execute"));

    let ctx = CallContext::new();
    let out = registry
        .execute("execute", &ctx, params(json!({ "command": "echo hi" })))
        .await;
    assert_eq!(out.content.trim(), "hi");

    let failed = registry
        .execute("execute", &ctx, params(json!({ "command": "exit 3" })))
        .await;
    assert_eq!(failed.content, "Exit code: 3");

    let missing = registry
        .execute("execute", &ctx, HashMap::new())
        .await;
    assert_eq!(missing.content, "Error: 'command' parameter is required");
}
