use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::{FileState, FilesUpdate};
use crate::store::KvStore;

/// Listing or glob entry. Directories end with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: u64, modified_at: Option<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size: Some(size),
            modified_at,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            is_dir: true,
            size: None,
            modified_at: None,
        }
    }
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    /// 1-indexed line number.
    pub line: usize,
    pub text: String,
}

/// How grep results are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    FilesWithMatches,
    Content,
    Count,
}

impl OutputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "files_with_matches" => Some(Self::FilesWithMatches),
            "content" => Some(Self::Content),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

/// Whether a backend persists writes itself or hands the caller a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageModel {
    /// Writes come back as `files_update` for the caller to merge.
    Checkpoint,
    /// Writes are committed to the medium directly.
    External,
    /// Routes to backends of both kinds.
    Mixed,
}

/// Operations a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_list: bool,
    pub can_read: bool,
    pub can_write: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub can_grep: bool,
    pub can_glob: bool,
    pub can_execute: bool,
}

impl Capabilities {
    /// Every file operation, no deletion or command execution.
    pub const FILES: Self = Self {
        can_list: true,
        can_read: true,
        can_write: true,
        can_edit: true,
        can_delete: false,
        can_grep: true,
        can_glob: true,
        can_execute: false,
    };

    pub const fn with_delete(mut self) -> Self {
        self.can_delete = true;
        self
    }

    pub const fn with_execute(mut self) -> Self {
        self.can_execute = true;
        self
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            can_list: self.can_list || other.can_list,
            can_read: self.can_read || other.can_read,
            can_write: self.can_write || other.can_write,
            can_edit: self.can_edit || other.can_edit,
            can_delete: self.can_delete || other.can_delete,
            can_grep: self.can_grep || other.can_grep,
            can_glob: self.can_glob || other.can_glob,
            can_execute: self.can_execute || other.can_execute,
        }
    }
}

/// Outcome of a create-only write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteResult {
    pub error: Option<String>,
    pub path: Option<String>,
    /// Present only for checkpoint backends.
    pub files_update: Option<FilesUpdate>,
}

impl WriteResult {
    pub fn ok(path: &str, files_update: Option<FilesUpdate>) -> Self {
        Self {
            error: None,
            path: Some(path.to_string()),
            files_update,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn already_exists(path: &str) -> Self {
        Self::err(format!(
            "Cannot write to {path} because it already exists. Read and then make an edit, or write to a new path."
        ))
    }
}

/// Outcome of a string-replacement edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EditResult {
    pub error: Option<String>,
    pub path: Option<String>,
    /// Present only for checkpoint backends.
    pub files_update: Option<FilesUpdate>,
    pub occurrences: Option<usize>,
}

impl EditResult {
    pub fn ok(path: &str, occurrences: usize, files_update: Option<FilesUpdate>) -> Self {
        Self {
            error: None,
            path: Some(path.to_string()),
            files_update,
            occurrences: Some(occurrences),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteResult {
    pub error: Option<String>,
    pub path: Option<String>,
    pub files_update: Option<FilesUpdate>,
}

impl DeleteResult {
    pub fn ok(path: &str, files_update: Option<FilesUpdate>) -> Self {
        Self {
            error: None,
            path: Some(path.to_string()),
            files_update,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Output of a command run in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub truncated: bool,
}

pub fn not_found(path: &str) -> String {
    format!("Error: File '{path}' not found")
}

/// Per-call runtime handed to every backend operation.
///
/// Everything here is borrowed for the duration of one call; backends must
/// not keep any of it.
#[derive(Clone, Copy, Default)]
pub struct CallContext<'a> {
    /// Caller-owned state read by checkpoint backends.
    pub files: Option<&'a FileState>,
    /// Store used by a runtime-bound persistent backend.
    pub store: Option<&'a Arc<dyn KvStore>>,
    pub assistant_id: Option<&'a str>,
    pub tool_call_id: Option<&'a str>,
}

impl<'a> CallContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(mut self, files: &'a FileState) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_store(mut self, store: &'a Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_assistant(mut self, assistant_id: &'a str) -> Self {
        self.assistant_id = Some(assistant_id);
        self
    }

    pub fn with_tool_call(mut self, tool_call_id: &'a str) -> Self {
        self.tool_call_id = Some(tool_call_id);
        self
    }
}

impl std::fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("files", &self.files.map(|m| m.len()))
            .field("store", &self.store.is_some())
            .field("assistant_id", &self.assistant_id)
            .field("tool_call_id", &self.tool_call_id)
            .finish()
    }
}
