use async_trait::async_trait;
use tracing::error;

use super::search::{glob_records, grep_records, list_children};
use super::{Backend, BackendResult};
use crate::error::BackendError;
use crate::record::{FileRecord, FileState, FilesUpdate};
use crate::types::{
    not_found, CallContext, Capabilities, DeleteResult, EditResult, FileInfo, GrepMatch,
    StorageModel, WriteResult,
};
use crate::util::{format_read_response, perform_replacement};

/// Backend over the caller's checkpointed file state.
///
/// Reads borrow `ctx.files`. Writes, edits and deletes never touch it: they
/// return a `files_update` that the caller merges with
/// [`merge_files`](crate::record::merge_files).
#[derive(Debug, Default, Clone, Copy)]
pub struct StateBackend;

impl StateBackend {
    pub fn new() -> Self {
        Self
    }

    fn files<'a>(ctx: &CallContext<'a>) -> BackendResult<&'a FileState> {
        ctx.files.ok_or_else(|| {
            error!("StateBackend called without file state; the caller must pass its files");
            BackendError::MissingState
        })
    }
}

fn entries(files: &FileState) -> impl Iterator<Item = (&str, &FileRecord)> {
    files.iter().map(|(k, v)| (k.as_str(), v))
}

fn single_update(path: &str, record: Option<FileRecord>) -> FilesUpdate {
    let mut update = FilesUpdate::new();
    update.insert(path.to_string(), record);
    update
}

#[async_trait]
impl Backend for StateBackend {
    fn name(&self) -> &'static str {
        "state"
    }

    fn storage_model(&self) -> StorageModel {
        StorageModel::Checkpoint
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES.with_delete()
    }

    async fn ls(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>> {
        Ok(list_children(entries(Self::files(ctx)?), path))
    }

    async fn read(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String> {
        Ok(match Self::files(ctx)?.get(path) {
            Some(record) => format_read_response(&record.text(), offset, limit),
            None => not_found(path),
        })
    }

    async fn write(&self, ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult> {
        if Self::files(ctx)?.contains_key(path) {
            return Ok(WriteResult::already_exists(path));
        }
        let update = single_update(path, Some(FileRecord::new(content)));
        Ok(WriteResult::ok(path, Some(update)))
    }

    async fn edit(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> BackendResult<EditResult> {
        let Some(record) = Self::files(ctx)?.get(path) else {
            return Ok(EditResult::err(not_found(path)));
        };
        match perform_replacement(&record.text(), old, new, replace_all) {
            Ok((content, occurrences)) => {
                let update = single_update(path, Some(record.updated(&content)));
                Ok(EditResult::ok(path, occurrences, Some(update)))
            }
            Err(msg) => Ok(EditResult::err(msg)),
        }
    }

    async fn grep_raw(
        &self,
        ctx: &CallContext<'_>,
        pattern: &str,
        path: Option<&str>,
        include: Option<&str>,
    ) -> BackendResult<Vec<GrepMatch>> {
        grep_records(entries(Self::files(ctx)?), pattern, path, include)
    }

    async fn glob_info(&self, ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>> {
        glob_records(entries(Self::files(ctx)?), pattern, path)
    }

    async fn delete(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<DeleteResult> {
        if !Self::files(ctx)?.contains_key(path) {
            return Ok(DeleteResult::err(not_found(path)));
        }
        Ok(DeleteResult::ok(path, Some(single_update(path, None))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::merge_files;
    use crate::types::OutputMode;

    #[tokio::test]
    async fn test_write_read_edit_cycle() {
        let backend = StateBackend::new();
        let mut files = FileState::new();

        let res = backend
            .write(&CallContext::new().with_files(&files), "/notes.txt", "hello world")
            .await
            .unwrap();
        assert!(res.error.is_none());
        let update = res.files_update.unwrap();
        assert!(update.contains_key("/notes.txt"));
        // Nothing changes until the caller merges.
        assert!(files.is_empty());
        merge_files(&mut files, update);

        let ctx = CallContext::new().with_files(&files);
        let content = backend.read(&ctx, "/notes.txt", 0, 100).await.unwrap();
        assert_eq!(content, "     1\thello world");

        let edit = backend.edit(&ctx, "/notes.txt", "hello", "hi", false).await.unwrap();
        assert_eq!(edit.occurrences, Some(1));
        let update = edit.files_update.unwrap();
        merge_files(&mut files, update);

        let ctx = CallContext::new().with_files(&files);
        let content = backend.read(&ctx, "/notes.txt", 0, 100).await.unwrap();
        assert!(content.contains("hi world"));
    }

    #[tokio::test]
    async fn test_missing_and_duplicate() {
        let backend = StateBackend::new();
        let mut files = FileState::new();
        files.insert("/dup.txt".into(), FileRecord::new("x"));
        let ctx = CallContext::new().with_files(&files);

        let edit = backend.edit(&ctx, "/missing.txt", "a", "b", false).await.unwrap();
        assert_eq!(edit.error.as_deref(), Some("Error: File '/missing.txt' not found"));

        let write = backend.write(&ctx, "/dup.txt", "y").await.unwrap();
        assert!(write.error.unwrap().contains("already exists"));

        let read = backend.read(&ctx, "/missing.txt", 0, 10).await.unwrap();
        assert_eq!(read, "Error: File '/missing.txt' not found");
    }

    #[tokio::test]
    async fn test_missing_state_fails_loudly() {
        let backend = StateBackend::new();
        let err = backend.ls(&CallContext::new(), "/").await.unwrap_err();
        assert!(matches!(err, BackendError::MissingState));
    }

    #[tokio::test]
    async fn test_delete_returns_tombstone() {
        let backend = StateBackend::new();
        let mut files = FileState::new();
        files.insert("/a.txt".into(), FileRecord::new("a"));

        let res = backend
            .delete(&CallContext::new().with_files(&files), "/a.txt")
            .await
            .unwrap();
        let update = res.files_update.unwrap();
        assert_eq!(update.get("/a.txt"), Some(&None));
        merge_files(&mut files, update);
        assert!(files.is_empty());

        let again = backend
            .delete(&CallContext::new().with_files(&files), "/a.txt")
            .await
            .unwrap();
        assert!(again.error.is_some());
    }

    #[tokio::test]
    async fn test_grep_and_glob() {
        let backend = StateBackend::new();
        let mut files = FileState::new();
        files.insert("/src/app.py".into(), FileRecord::new("def main():\n    pass"));
        files.insert("/README.md".into(), FileRecord::new("main entry"));
        let ctx = CallContext::new().with_files(&files);

        let out = backend
            .grep(&ctx, "main", None, None, OutputMode::FilesWithMatches)
            .await
            .unwrap();
        assert_eq!(out, "/README.md\n/src/app.py");

        let out = backend.grep(&ctx, "[", None, None, OutputMode::Content).await.unwrap();
        assert!(out.starts_with("Invalid regex pattern"));

        let out = backend.grep(&ctx, "absent", None, None, OutputMode::Content).await.unwrap();
        assert_eq!(out, "No matches found for pattern: 'absent'");

        let paths = backend.glob(&ctx, "**/*.py", "/").await.unwrap();
        assert_eq!(paths, vec!["/src/app.py"]);
    }

    #[tokio::test]
    async fn test_empty_file_read() {
        let backend = StateBackend::new();
        let mut files = FileState::new();
        files.insert("/empty.txt".into(), FileRecord::new(""));
        let ctx = CallContext::new().with_files(&files);
        let out = backend.read(&ctx, "/empty.txt", 0, 10).await.unwrap();
        assert_eq!(out, crate::util::EMPTY_CONTENT_WARNING);
    }
}
