//! Pluggable storage behind the agent's virtual filesystem.
//!
//! Every backend speaks the same [`Backend`] trait over absolute virtual
//! paths. Two storage models exist:
//!
//! - **checkpoint** ([`StateBackend`]): reads borrow the caller's
//!   [`FileState`](crate::record::FileState) and writes come back as a
//!   `files_update` patch the caller merges;
//! - **external** ([`StoreBackend`], [`FilesystemBackend`], [`SandboxBackend`]):
//!   writes are committed directly and `files_update` is `None`.
//!
//! [`CompositeBackend`] routes by longest path prefix across both kinds.
//!
//! `ls` is non-recursive everywhere: direct children only, with
//! subdirectories listed as `is_dir` entries ending in `/`.

pub mod composite;
pub mod filesystem;
pub mod sandbox;
pub mod search;
pub mod state;
pub mod store;
pub mod text_search;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{
    CallContext, Capabilities, DeleteResult, EditResult, ExecuteResponse, FileInfo, GrepMatch,
    OutputMode, StorageModel, WriteResult,
};
use crate::util::truncate_if_too_long;

pub use composite::CompositeBackend;
pub use filesystem::FilesystemBackend;
pub use sandbox::SandboxBackend;
pub use search::format_grep_results;
pub use state::StateBackend;
pub use store::StoreBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Trait for virtual filesystem backends.
///
/// Paths are absolute virtual paths. User-data outcomes (missing file,
/// existing file, ambiguous edit, empty file) are returned in `Ok`; `Err` is
/// for bad input, unreachable media and unsupported operations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    fn storage_model(&self) -> StorageModel;

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES
    }

    /// List the direct children of a directory.
    async fn ls(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>>;

    /// Read `limit` lines after skipping `offset`, numbered from 1.
    async fn read(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String>;

    /// Create a new file. Fails in-band if the path exists.
    async fn write(&self, ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult>;

    /// Replace `old` with `new` in an existing file.
    async fn edit(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> BackendResult<EditResult>;

    /// Regex search returning structured matches.
    async fn grep_raw(
        &self,
        ctx: &CallContext<'_>,
        pattern: &str,
        path: Option<&str>,
        include: Option<&str>,
    ) -> BackendResult<Vec<GrepMatch>>;

    /// Regex search rendered for an agent.
    async fn grep(
        &self,
        ctx: &CallContext<'_>,
        pattern: &str,
        path: Option<&str>,
        include: Option<&str>,
        mode: OutputMode,
    ) -> BackendResult<String> {
        match self.grep_raw(ctx, pattern, path, include).await {
            Ok(matches) if matches.is_empty() => {
                Ok(format!("No matches found for pattern: '{pattern}'"))
            }
            Ok(matches) => Ok(truncate_if_too_long(format_grep_results(&matches, mode))),
            Err(BackendError::InvalidPattern(msg)) => Ok(msg),
            Err(e) => Err(e),
        }
    }

    /// Files under `path` matching a glob relative to it.
    async fn glob_info(&self, ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>>;

    async fn glob(&self, ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<String>> {
        let infos = self.glob_info(ctx, pattern, path).await?;
        Ok(truncate_if_too_long(
            infos.into_iter().map(|i| i.path).collect::<Vec<_>>(),
        ))
    }

    async fn delete(&self, _ctx: &CallContext<'_>, _path: &str) -> BackendResult<DeleteResult> {
        Err(BackendError::not_implemented("delete", self.name()))
    }

    /// Run a shell command where the backend has somewhere to run it.
    async fn execute(
        &self,
        _ctx: &CallContext<'_>,
        _command: &str,
        _timeout: Option<Duration>,
    ) -> BackendResult<ExecuteResponse> {
        Err(BackendError::not_implemented("execute", self.name()))
    }
}
