use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::text_search::{
    search_with_fallback, RegexWalkSearch, RipgrepSearch, SearchRequest, TextSearch,
    DEFAULT_SEARCH_TIMEOUT,
};
use super::{Backend, BackendResult};
use crate::error::{BackendError, PathError};
use crate::types::{
    not_found, CallContext, Capabilities, DeleteResult, EditResult, FileInfo, GrepMatch,
    StorageModel, WriteResult,
};
use crate::util::pattern::{build_glob_set, build_include_filter, compile_regex};
use crate::util::{format_read_response, iso_from_system_time, perform_replacement, validate_and_normalize};

pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 10;

/// Backend over a directory on the host.
///
/// In virtual mode (the default) every path is resolved under `root`:
/// traversal is rejected before any disk access, the nearest existing
/// ancestor must canonicalize inside the root and files are opened without
/// following symlinks. Outside virtual mode, absolute paths are used as given.
pub struct FilesystemBackend {
    root: PathBuf,
    virtual_mode: bool,
    max_file_size: u64,
    searchers: Vec<Arc<dyn TextSearch>>,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // The root may not exist yet; containment canonicalizes it on use.
        let root = root
            .canonicalize()
            .or_else(|_| std::path::absolute(&root))
            .unwrap_or(root);
        Self {
            root,
            virtual_mode: true,
            max_file_size: DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024,
            searchers: searchers_for(true, DEFAULT_SEARCH_TIMEOUT),
        }
    }

    pub fn with_virtual_mode(mut self, virtual_mode: bool) -> Self {
        self.virtual_mode = virtual_mode;
        self
    }

    pub fn with_max_file_size_mb(mut self, mb: u64) -> Self {
        self.max_file_size = mb.saturating_mul(1024 * 1024);
        self
    }

    /// Replace the content search chain.
    pub fn with_searchers(mut self, searchers: Vec<Arc<dyn TextSearch>>) -> Self {
        self.searchers = searchers;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path to a host path.
    pub fn resolve(&self, path: &str) -> BackendResult<PathBuf> {
        if !self.virtual_mode {
            let p = Path::new(path);
            return Ok(if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.root.join(p)
            });
        }

        let vpath = validate_and_normalize(path, None)?;
        let full = self.root.join(vpath.trim_start_matches('/'));
        if full.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathError::Traversal(path.to_string()).into());
        }
        self.ensure_contained(&full, &vpath)?;
        Ok(full)
    }

    /// The nearest existing ancestor of `full` must canonicalize under root.
    fn ensure_contained(&self, full: &Path, vpath: &str) -> BackendResult<()> {
        let real_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let mut probe = Some(full);
        while let Some(candidate) = probe {
            // Above the root nothing is left to check.
            if !candidate.starts_with(&self.root) {
                return Ok(());
            }
            if candidate.symlink_metadata().is_ok() {
                let real = candidate.canonicalize()?;
                if !real.starts_with(&real_root) {
                    return Err(PathError::OutsideRoot {
                        path: vpath.to_string(),
                        root: self.root.display().to_string(),
                    }
                    .into());
                }
                return Ok(());
            }
            probe = candidate.parent();
        }
        Ok(())
    }

    /// Map a host path back to the path callers use.
    fn to_virtual(&self, full: &Path) -> Option<String> {
        if !self.virtual_mode {
            return Some(full.to_string_lossy().into_owned());
        }
        let rel = full.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", parts.join("/")))
    }

    fn info_for(&self, full: &Path, meta: &std::fs::Metadata) -> Option<FileInfo> {
        let vpath = self.to_virtual(full)?;
        if meta.is_dir() {
            Some(FileInfo::dir(vpath))
        } else {
            Some(FileInfo::file(
                vpath,
                meta.len(),
                meta.modified().ok().map(iso_from_system_time),
            ))
        }
    }
}

/// Ripgrep when it is installed and wanted, then the in-process walk.
pub fn searchers_for(use_ripgrep: bool, timeout: std::time::Duration) -> Vec<Arc<dyn TextSearch>> {
    let mut searchers: Vec<Arc<dyn TextSearch>> = Vec::new();
    if use_ripgrep {
        if let Some(rg) = RipgrepSearch::detect(timeout) {
            searchers.push(Arc::new(rg));
        }
    }
    searchers.push(Arc::new(RegexWalkSearch));
    searchers
}

fn open_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut opts = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_NOFOLLOW);
    }
    opts
}

fn open_read(path: &Path) -> std::io::Result<File> {
    let mut opts = open_options();
    opts.read(true);
    opts.open(path)
}

#[cfg(unix)]
fn is_symlink_loop(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ELOOP)
}

#[cfg(not(unix))]
fn is_symlink_loop(_e: &std::io::Error) -> bool {
    false
}

fn io_error(e: std::io::Error, path: &str) -> BackendError {
    if is_symlink_loop(&e) {
        return BackendError::PermissionDenied(format!("{path} is a symbolic link"));
    }
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => BackendError::PermissionDenied(path.to_string()),
        _ => BackendError::Io(e),
    }
}

/// Read a file's text, or `None` when it does not exist or is not a file.
fn read_text(full: &Path, vpath: &str) -> BackendResult<Option<String>> {
    match full.symlink_metadata() {
        Ok(meta) if meta.is_file() => {}
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(BackendError::PermissionDenied(format!("{vpath} is a symbolic link")));
        }
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(e, vpath)),
    }
    let mut file = open_read(full).map_err(|e| io_error(e, vpath))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| io_error(e, vpath))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn storage_model(&self) -> StorageModel {
        StorageModel::External
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES.with_delete()
    }

    async fn ls(&self, _ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>> {
        let dir = self.resolve(path)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("ls {} -> empty ({})", path, e);
                return Ok(Vec::new());
            }
        };

        let mut infos = Vec::new();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if self.virtual_mode && meta.file_type().is_symlink() {
                continue;
            }
            if let Some(info) = self.info_for(&entry.path(), &meta) {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    async fn read(
        &self,
        _ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String> {
        let full = self.resolve(path)?;
        Ok(match read_text(&full, path)? {
            Some(content) => format_read_response(&content, offset, limit),
            None => not_found(path),
        })
    }

    async fn write(&self, _ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult> {
        let full = self.resolve(path)?;
        if full.symlink_metadata().is_ok() {
            return Ok(WriteResult::already_exists(path));
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(e, path))?;
        }

        let mut opts = open_options();
        opts.write(true).create_new(true);
        let mut file = match opts.open(&full) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(WriteResult::already_exists(path));
            }
            Err(e) => return Err(io_error(e, path)),
        };
        file.write_all(content.as_bytes()).map_err(|e| io_error(e, path))?;
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
        let full = self.resolve(path)?;
        let Some(content) = read_text(&full, path)? else {
            return Ok(EditResult::err(not_found(path)));
        };
        match perform_replacement(&content, old, new, replace_all) {
            Ok((updated, occurrences)) => {
                let mut opts = open_options();
                opts.write(true).truncate(true);
                let mut file = opts.open(&full).map_err(|e| io_error(e, path))?;
                file.write_all(updated.as_bytes()).map_err(|e| io_error(e, path))?;
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
        if let Some(include) = include {
            build_include_filter(include)?;
        }
        let base = self.resolve(path.unwrap_or("/"))?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let req = SearchRequest {
            pattern: pattern.to_string(),
            base,
            include: include.map(str::to_string),
            max_file_size: self.max_file_size,
        };
        let raw = search_with_fallback(&self.searchers, &req)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut matches: Vec<GrepMatch> = raw
            .into_iter()
            .filter_map(|m| {
                let full = if m.path.is_absolute() { m.path } else { self.root.join(m.path) };
                Some(GrepMatch {
                    path: self.to_virtual(&full)?,
                    line: m.line,
                    text: m.text,
                })
            })
            .collect();
        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        Ok(matches)
    }

    async fn glob_info(&self, _ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>> {
        let set = build_glob_set(pattern.trim_start_matches('/'))
            .map_err(|e| BackendError::InvalidPattern(format!("Invalid glob pattern: {e}")))?;
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("glob: skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&base) else { continue };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !set.is_match(&rel) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if let Some(info) = self.info_for(entry.path(), &meta) {
                    infos.push(info);
                }
            }
        }
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    async fn delete(&self, _ctx: &CallContext<'_>, path: &str) -> BackendResult<DeleteResult> {
        let full = self.resolve(path)?;
        let meta = match full.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeleteResult::err(not_found(path)));
            }
            Err(e) => return Err(io_error(e, path)),
        };
        let removed = if meta.is_dir() {
            std::fs::remove_dir(&full)
        } else {
            std::fs::remove_file(&full)
        };
        match removed {
            Ok(()) => Ok(DeleteResult::ok(path, None)),
            Err(_) if meta.is_dir() => Ok(DeleteResult::err(format!(
                "Error: Directory '{path}' is not empty. Delete its files first."
            ))),
            Err(e) => Err(io_error(e, path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputMode;

    fn backend(dir: &Path) -> FilesystemBackend {
        FilesystemBackend::new(dir).with_searchers(vec![Arc::new(RegexWalkSearch)])
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_disk_access() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();

        let err = backend.read(&ctx, "../etc/passwd", 0, 10).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPath(PathError::Traversal(_))));
        let err = backend.write(&ctx, "/a/../../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPath(_)));
        assert!(!tmp.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_relative_root_created_by_first_write() {
        let tmp = tempfile::tempdir_in(".").unwrap();
        let relative = Path::new(".").join(tmp.path().file_name().unwrap()).join("workspace");
        assert!(relative.is_relative());
        assert!(!relative.exists());

        let backend = backend(&relative);
        assert!(backend.root().is_absolute());
        let ctx = CallContext::new();

        let res = backend.write(&ctx, "/a.txt", "alpha").await.unwrap();
        assert!(res.error.is_none());
        assert_eq!(backend.read(&ctx, "/a.txt", 0, 10).await.unwrap(), "     1\talpha");

        let edit = backend.edit(&ctx, "/a.txt", "alpha", "beta", false).await.unwrap();
        assert!(edit.error.is_none());
        let listing = backend.ls(&ctx, "/").await.unwrap();
        assert_eq!(listing[0].path, "/a.txt");
        let found = backend
            .grep(&ctx, "beta", Some("/"), None, OutputMode::FilesWithMatches)
            .await
            .unwrap();
        assert_eq!(found, "/a.txt");
    }

    #[tokio::test]
    async fn test_write_read_edit_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();

        let res = backend.write(&ctx, "/dir/notes.txt", "hello world\nsecond").await.unwrap();
        assert!(res.error.is_none());
        assert!(res.files_update.is_none());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("dir/notes.txt")).unwrap(),
            "hello world\nsecond"
        );

        assert_eq!(
            backend.read(&ctx, "/dir/notes.txt", 1, 5).await.unwrap(),
            "     2\tsecond"
        );

        let dup = backend.write(&ctx, "/dir/notes.txt", "again").await.unwrap();
        assert!(dup.error.unwrap().contains("already exists"));

        let edit = backend.edit(&ctx, "/dir/notes.txt", "hello", "hi", false).await.unwrap();
        assert_eq!(edit.occurrences, Some(1));
        assert!(backend.read(&ctx, "/dir/notes.txt", 0, 5).await.unwrap().contains("hi world"));

        let missing = backend.edit(&ctx, "/nope.txt", "a", "b", false).await.unwrap();
        assert_eq!(missing.error.as_deref(), Some("Error: File '/nope.txt' not found"));
    }

    #[tokio::test]
    async fn test_ls_is_non_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "b").unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();

        let root: Vec<_> = backend.ls(&ctx, "/").await.unwrap().into_iter().map(|i| i.path).collect();
        assert_eq!(root, vec!["/a.txt", "/sub/"]);

        let sub: Vec<_> = backend.ls(&ctx, "/sub").await.unwrap().into_iter().map(|i| i.path).collect();
        assert_eq!(sub, vec!["/sub/b.txt", "/sub/deeper/"]);

        assert!(backend.ls(&ctx, "/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_grep_and_glob() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/main.py"), "import os\nprint(os.name)\n").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "os notes\n").unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();

        let matches = backend.grep_raw(&ctx, "os", None, Some("*.py")).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.path == "/src/main.py"));

        let out = backend.grep(&ctx, "[", None, None, OutputMode::Content).await.unwrap();
        assert!(out.starts_with("Invalid regex pattern"));

        let py = backend.glob(&ctx, "**/*.py", "/").await.unwrap();
        assert_eq!(py, vec!["/src/main.py"]);
        let top = backend.glob(&ctx, "*.md", "/").await.unwrap();
        assert_eq!(top, vec!["/notes.md"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            tmp.path().join("file-link"),
        )
        .unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();

        let err = backend.read(&ctx, "/link/secret.txt", 0, 10).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPath(PathError::OutsideRoot { .. })));

        let err = backend.read(&ctx, "/file-link", 0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidPath(_) | BackendError::PermissionDenied(_)
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::new();
        backend.write(&ctx, "/d/x.txt", "x").await.unwrap();

        let busy = backend.delete(&ctx, "/d").await.unwrap();
        assert!(busy.error.unwrap().contains("not empty"));
        assert!(backend.delete(&ctx, "/d/x.txt").await.unwrap().error.is_none());
        assert!(backend.delete(&ctx, "/d").await.unwrap().error.is_none());
        assert!(backend.delete(&ctx, "/d").await.unwrap().error.is_some());
    }
}
