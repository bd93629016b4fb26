//! Longest-prefix router over several backends.
//!
//! Callers see one namespace. A path under a registered prefix is served by
//! that prefix's backend with the prefix stripped; everything else goes to the
//! default backend. Paths coming back (listings, matches, `files_update`
//! keys) are re-prefixed so stripped paths never leak to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::search::relative_to;
use super::{Backend, BackendResult};
use crate::error::BackendError;
use crate::record::{FileState, FilesUpdate};
use crate::types::{
    CallContext, Capabilities, DeleteResult, EditResult, ExecuteResponse, FileInfo, GrepMatch,
    StorageModel, WriteResult,
};
use crate::util::path::as_dir_prefix;
use crate::util::pattern::build_glob_set;

struct Route {
    /// Always starts and ends with `/`.
    prefix: String,
    backend: Arc<dyn Backend>,
}

impl Route {
    /// Path as seen by the routed backend, or `None` when outside the route.
    fn strip(&self, path: &str) -> Option<String> {
        if let Some(rest) = path.strip_prefix(self.prefix.as_str()) {
            return Some(format!("/{rest}"));
        }
        (path == self.prefix.trim_end_matches('/')).then(|| "/".to_string())
    }

    /// Inverse of [`strip`](Self::strip). `None` for paths that are not absolute.
    fn restore(&self, path: &str) -> Option<String> {
        path.starts_with('/')
            .then(|| format!("{}{}", self.prefix.trim_end_matches('/'), path))
    }

    fn restore_update(&self, update: FilesUpdate) -> Result<FilesUpdate, String> {
        update
            .into_iter()
            .map(|(key, record)| match self.restore(&key) {
                Some(full) => Ok((full, record)),
                None => Err(key),
            })
            .collect()
    }

    /// The caller's state narrowed to this route, keys stripped.
    fn scoped_files(&self, files: Option<&FileState>) -> Option<FileState> {
        if self.backend.storage_model() == StorageModel::External {
            return None;
        }
        files.map(|files| {
            files
                .range(self.prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(self.prefix.as_str()))
                .filter_map(|(k, v)| self.strip(k).map(|inner| (inner, v.clone())))
                .collect()
        })
    }

    fn partial_failure(&self, key: &str) -> String {
        format!(
            "Error: partial failure: {} backend returned '{key}', which cannot be mapped under {}",
            self.backend.name(),
            self.prefix
        )
    }
}

/// Name the caller's path in an in-band error from a routed backend.
fn caller_error(error: &str, inner: &str, path: &str) -> String {
    let exists = |p: &str| WriteResult::already_exists(p).error.unwrap_or_default();
    if error == exists(inner) {
        return exists(path);
    }
    error.replace(&format!("'{inner}'"), &format!("'{path}'"))
}

fn routed_ctx<'b>(ctx: &CallContext<'b>, files: Option<&'b FileState>) -> CallContext<'b> {
    CallContext {
        files,
        store: ctx.store,
        assistant_id: ctx.assistant_id,
        tool_call_id: ctx.tool_call_id,
    }
}

/// Normalize a route prefix to `/name/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", as_dir_prefix(trimmed))
    }
}

/// Backend that dispatches by the longest matching path prefix.
pub struct CompositeBackend {
    default: Arc<dyn Backend>,
    routes: Vec<Route>,
}

impl CompositeBackend {
    pub fn new<P: AsRef<str>>(
        default: Arc<dyn Backend>,
        routes: impl IntoIterator<Item = (P, Arc<dyn Backend>)>,
    ) -> Self {
        let mut table: Vec<Route> = Vec::new();
        for (prefix, backend) in routes {
            let prefix = normalize_prefix(prefix.as_ref());
            if prefix == "/" {
                warn!("Ignoring route for '/': use it as the default backend instead");
                continue;
            }
            debug!("Routing {} to {} backend", prefix, backend.name());
            table.push(Route { prefix, backend });
        }
        // Stable sort keeps registration order among equal lengths.
        table.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            default,
            routes: table,
        }
    }

    /// Registered prefixes, longest first.
    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.prefix.as_str()).collect()
    }

    /// Directory entries for routes mounted directly under `dir`.
    fn child_routes(&self, dir: &str) -> Vec<FileInfo> {
        let listed = as_dir_prefix(dir);
        self.routes
            .iter()
            .filter(|r| {
                r.prefix
                    .strip_prefix(listed.as_str())
                    .is_some_and(|rest| !rest.is_empty() && !rest.trim_end_matches('/').contains('/'))
            })
            .map(|r| FileInfo::dir(r.prefix.as_str()))
            .collect()
    }

    fn route_for(&self, path: &str) -> Option<(&Route, String)> {
        self.routes
            .iter()
            .find_map(|route| route.strip(path).map(|inner| (route, inner)))
    }
}

/// Collapse duplicates by path and sort.
fn dedup_infos(infos: Vec<FileInfo>) -> Vec<FileInfo> {
    let mut by_path: BTreeMap<String, FileInfo> = BTreeMap::new();
    for info in infos {
        by_path.entry(info.path.clone()).or_insert(info);
    }
    by_path.into_values().collect()
}

fn aggregate_error(route: &Route, err: BackendError) -> BackendError {
    match err {
        BackendError::InvalidPattern(_) | BackendError::InvalidPath(_) => err,
        other => {
            warn!("Route {} failed during aggregation: {}", route.prefix, other);
            BackendError::PartialFailure(format!("{} ({}): {other}", route.prefix, route.backend.name()))
        }
    }
}

#[async_trait]
impl Backend for CompositeBackend {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn storage_model(&self) -> StorageModel {
        StorageModel::Mixed
    }

    fn capabilities(&self) -> Capabilities {
        self.routes
            .iter()
            .fold(self.default.capabilities(), |caps, r| caps.union(r.backend.capabilities()))
    }

    async fn ls(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>> {
        if let Some((route, inner)) = self.route_for(path) {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let mut infos: Vec<FileInfo> = route
                .backend
                .ls(&rctx, &inner)
                .await?
                .into_iter()
                .filter_map(|mut info| {
                    info.path = route.restore(&info.path)?;
                    Some(info)
                })
                .collect();
            infos.extend(self.child_routes(path));
            return Ok(dedup_infos(infos));
        }

        let mut infos = self.default.ls(ctx, path).await?;
        if path != "/" {
            infos.extend(self.child_routes(path));
            return Ok(dedup_infos(infos));
        }
        for route in &self.routes {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let routed = route
                .backend
                .ls(&rctx, "/")
                .await
                .map_err(|e| aggregate_error(route, e))?;
            infos.push(FileInfo::dir(route.prefix.as_str()));
            infos.extend(routed.into_iter().filter_map(|mut info| {
                info.path = route.restore(&info.path)?;
                Some(info)
            }));
        }
        Ok(dedup_infos(infos))
    }

    async fn read(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String> {
        match self.route_for(path) {
            Some((route, inner)) => {
                let scoped = route.scoped_files(ctx.files);
                let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
                let out = route.backend.read(&rctx, &inner, offset, limit).await?;
                // Not-found messages name the caller's path.
                if out.starts_with("Error:") {
                    return Ok(caller_error(&out, &inner, path));
                }
                Ok(out)
            }
            None => self.default.read(ctx, path, offset, limit).await,
        }
    }

    async fn write(&self, ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult> {
        let Some((route, inner)) = self.route_for(path) else {
            return self.default.write(ctx, path, content).await;
        };
        let scoped = route.scoped_files(ctx.files);
        let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
        let res = route.backend.write(&rctx, &inner, content).await?;
        if let Some(error) = res.error {
            return Ok(WriteResult::err(caller_error(&error, &inner, path)));
        }
        match res.files_update.map(|u| route.restore_update(u)).transpose() {
            Ok(files_update) => Ok(WriteResult::ok(path, files_update)),
            Err(key) => Ok(WriteResult::err(route.partial_failure(&key))),
        }
    }

    async fn edit(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> BackendResult<EditResult> {
        let Some((route, inner)) = self.route_for(path) else {
            return self.default.edit(ctx, path, old, new, replace_all).await;
        };
        let scoped = route.scoped_files(ctx.files);
        let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
        let res = route.backend.edit(&rctx, &inner, old, new, replace_all).await?;
        if let Some(error) = res.error {
            return Ok(EditResult::err(caller_error(&error, &inner, path)));
        }
        match res.files_update.map(|u| route.restore_update(u)).transpose() {
            Ok(files_update) => Ok(EditResult::ok(path, res.occurrences.unwrap_or(0), files_update)),
            Err(key) => Ok(EditResult::err(route.partial_failure(&key))),
        }
    }

    async fn grep_raw(
        &self,
        ctx: &CallContext<'_>,
        pattern: &str,
        path: Option<&str>,
        include: Option<&str>,
    ) -> BackendResult<Vec<GrepMatch>> {
        let base = path.unwrap_or("/");
        if let Some((route, inner)) = self.route_for(base) {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let matches = route.backend.grep_raw(&rctx, pattern, Some(&inner), include).await?;
            return Ok(matches
                .into_iter()
                .filter_map(|mut m| {
                    m.path = route.restore(&m.path)?;
                    Some(m)
                })
                .collect());
        }

        let mut matches = self.default.grep_raw(ctx, pattern, path, include).await?;
        if base != "/" {
            return Ok(matches);
        }
        for route in &self.routes {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let routed = route
                .backend
                .grep_raw(&rctx, pattern, Some("/"), include)
                .await
                .map_err(|e| aggregate_error(route, e))?;
            matches.extend(routed.into_iter().filter_map(|mut m| {
                m.path = route.restore(&m.path)?;
                Some(m)
            }));
        }
        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        matches.dedup_by(|a, b| a.path == b.path && a.line == b.line);
        Ok(matches)
    }

    async fn glob_info(&self, ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>> {
        if let Some((route, inner)) = self.route_for(path) {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let infos = route.backend.glob_info(&rctx, pattern, &inner).await?;
            return Ok(infos
                .into_iter()
                .filter_map(|mut info| {
                    info.path = route.restore(&info.path)?;
                    Some(info)
                })
                .collect());
        }

        let mut infos = self.default.glob_info(ctx, pattern, path).await?;
        if path != "/" {
            return Ok(infos);
        }
        // Routed results are re-checked against the pattern from the real root.
        let set = build_glob_set(pattern.trim_start_matches('/'))
            .map_err(|e| BackendError::InvalidPattern(format!("Invalid glob pattern: {e}")))?;
        for route in &self.routes {
            let scoped = route.scoped_files(ctx.files);
            let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
            let routed = route
                .backend
                .glob_info(&rctx, "**", "/")
                .await
                .map_err(|e| aggregate_error(route, e))?;
            infos.extend(routed.into_iter().filter_map(|mut info| {
                info.path = route.restore(&info.path)?;
                relative_to(&info.path, "/")
                    .is_some_and(|rel| set.is_match(rel))
                    .then_some(info)
            }));
        }
        Ok(dedup_infos(infos))
    }

    async fn delete(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<DeleteResult> {
        let Some((route, inner)) = self.route_for(path) else {
            return self.default.delete(ctx, path).await;
        };
        let scoped = route.scoped_files(ctx.files);
        let rctx = routed_ctx(ctx, scoped.as_ref().or(ctx.files));
        let res = route.backend.delete(&rctx, &inner).await?;
        if let Some(error) = res.error {
            return Ok(DeleteResult::err(caller_error(&error, &inner, path)));
        }
        match res.files_update.map(|u| route.restore_update(u)).transpose() {
            Ok(files_update) => Ok(DeleteResult::ok(path, files_update)),
            Err(key) => Ok(DeleteResult::err(route.partial_failure(&key))),
        }
    }

    async fn execute(
        &self,
        ctx: &CallContext<'_>,
        command: &str,
        timeout: Option<Duration>,
    ) -> BackendResult<ExecuteResponse> {
        self.default.execute(ctx, command, timeout).await
    }
}
