use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::search::{glob_records, grep_records, list_children};
use super::{Backend, BackendResult};
use crate::error::BackendError;
use crate::record::FileRecord;
use crate::store::{Item, KvStore, SearchQuery};
use crate::types::{
    not_found, CallContext, Capabilities, DeleteResult, EditResult, FileInfo, GrepMatch,
    StorageModel, WriteResult,
};
use crate::util::path::{as_dir_prefix, is_under};
use crate::util::{format_read_response, perform_replacement};

/// Items fetched per store search call.
pub const DEFAULT_PAGE_SIZE: usize = 100;

const FILESYSTEM_NAMESPACE: &str = "filesystem";

/// Backend over a persistent key-value store that outlives a conversation.
///
/// Files live under `[assistant_id, "filesystem"]` when the call carries an
/// assistant id, otherwise under `["filesystem"]`.
pub struct StoreBackend {
    store: Option<Arc<dyn KvStore>>,
    page_size: usize,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store: Some(store),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Use whatever store each call's context carries.
    pub fn from_runtime() -> Self {
        Self {
            store: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn store<'a>(&'a self, ctx: &CallContext<'a>) -> BackendResult<&'a Arc<dyn KvStore>> {
        self.store.as_ref().or(ctx.store).ok_or_else(|| {
            BackendError::StoreUnavailable(
                "no store was configured and the call context carries none".to_string(),
            )
        })
    }

    fn namespace(ctx: &CallContext<'_>) -> Vec<String> {
        match ctx.assistant_id {
            Some(id) if !id.is_empty() => vec![id.to_string(), FILESYSTEM_NAMESPACE.to_string()],
            _ => vec![FILESYSTEM_NAMESPACE.to_string()],
        }
    }

    /// Page through the store until an empty page.
    ///
    /// A store may return fewer items than asked for without being exhausted,
    /// so a short page is not treated as the end.
    async fn all_items(
        &self,
        store: &Arc<dyn KvStore>,
        namespace: &[String],
        key_prefix: Option<String>,
    ) -> BackendResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut offset = 0;
        loop {
            let mut query = SearchQuery::page(self.page_size, offset);
            query.key_prefix = key_prefix.clone();
            let page = store.search(namespace, &query).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            items.extend(page);
        }
        debug!("Store search in {:?} returned {} items", namespace, items.len());
        Ok(items)
    }

    /// Load every valid record whose key starts with `key_prefix`.
    async fn records(
        &self,
        ctx: &CallContext<'_>,
        key_prefix: Option<String>,
    ) -> BackendResult<Vec<(String, FileRecord)>> {
        let store = self.store(ctx)?;
        let namespace = Self::namespace(ctx);
        let items = self.all_items(store, &namespace, key_prefix).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| match record_from_item(&item) {
                Ok(record) => Some((item.key, record)),
                Err(e) => {
                    warn!("Skipping store item {}: {}", item.key, e);
                    None
                }
            })
            .collect())
    }

    async fn get_record(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
    ) -> BackendResult<Option<Result<FileRecord, String>>> {
        let store = self.store(ctx)?;
        let item = store.get(&Self::namespace(ctx), path).await?;
        Ok(item.map(|item| record_from_item(&item)))
    }

    async fn put_record(&self, ctx: &CallContext<'_>, path: &str, record: &FileRecord) -> BackendResult<()> {
        let store = self.store(ctx)?;
        let value = serde_json::to_value(record).map_err(crate::error::StoreError::from)?;
        store.put(&Self::namespace(ctx), path, value).await?;
        Ok(())
    }
}

/// Decode a stored item, checking the content and timestamp fields.
fn record_from_item(item: &Item) -> Result<FileRecord, String> {
    serde_json::from_value::<FileRecord>(item.value.clone())
        .map_err(|e| format!("Store item does not contain valid file data: {e}"))
}

fn prefix_for(path: Option<&str>) -> Option<String> {
    match path {
        None | Some("/") | Some("") => None,
        Some(p) => Some(p.trim_end_matches('/').to_string()),
    }
}

fn pairs(records: &[(String, FileRecord)]) -> impl Iterator<Item = (&str, &FileRecord)> {
    records.iter().map(|(k, v)| (k.as_str(), v))
}

#[async_trait]
impl Backend for StoreBackend {
    fn name(&self) -> &'static str {
        "store"
    }

    fn storage_model(&self) -> StorageModel {
        StorageModel::External
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES.with_delete()
    }

    async fn ls(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<Vec<FileInfo>> {
        let dir = as_dir_prefix(path);
        let key_prefix = (dir != "/").then(|| dir.clone());
        let records = self.records(ctx, key_prefix).await?;
        Ok(list_children(pairs(&records), &dir))
    }

    async fn read(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> BackendResult<String> {
        Ok(match self.get_record(ctx, path).await? {
            Some(Ok(record)) => format_read_response(&record.text(), offset, limit),
            Some(Err(msg)) => format!("Error: {msg}"),
            None => not_found(path),
        })
    }

    async fn write(&self, ctx: &CallContext<'_>, path: &str, content: &str) -> BackendResult<WriteResult> {
        let store = self.store(ctx)?;
        if store.get(&Self::namespace(ctx), path).await?.is_some() {
            return Ok(WriteResult::already_exists(path));
        }
        self.put_record(ctx, path, &FileRecord::new(content)).await?;
        Ok(WriteResult::ok(path, None))
    }

    async fn edit(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> BackendResult<EditResult> {
        let record = match self.get_record(ctx, path).await? {
            Some(Ok(record)) => record,
            Some(Err(msg)) => return Ok(EditResult::err(format!("Error: {msg}"))),
            None => return Ok(EditResult::err(not_found(path))),
        };
        match perform_replacement(&record.text(), old, new, replace_all) {
            Ok((content, occurrences)) => {
                self.put_record(ctx, path, &record.updated(&content)).await?;
                Ok(EditResult::ok(path, occurrences, None))
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
        // Validate before touching the store.
        crate::util::pattern::compile_regex(pattern)?;
        let records = self.records(ctx, prefix_for(path)).await?;
        grep_records(pairs(&records), pattern, path, include)
    }

    async fn glob_info(&self, ctx: &CallContext<'_>, pattern: &str, path: &str) -> BackendResult<Vec<FileInfo>> {
        let records = self.records(ctx, prefix_for(Some(path))).await?;
        let under: Vec<_> = records.into_iter().filter(|(k, _)| is_under(k, path)).collect();
        glob_records(pairs(&under), pattern, path)
    }

    async fn delete(&self, ctx: &CallContext<'_>, path: &str) -> BackendResult<DeleteResult> {
        let store = self.store(ctx)?;
        if store.delete(&Self::namespace(ctx), path).await? {
            Ok(DeleteResult::ok(path, None))
        } else {
            Ok(DeleteResult::err(not_found(path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn backend() -> (StoreBackend, Arc<dyn KvStore>) {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        (StoreBackend::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_write_commits_directly() {
        let (backend, store) = backend();
        let ctx = CallContext::new();

        let res = backend.write(&ctx, "/memories/readme.md", "beta").await.unwrap();
        assert!(res.error.is_none());
        assert!(res.files_update.is_none());

        let item = store
            .get(&["filesystem".to_string()], "/memories/readme.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.value["content"], json!(["beta"]));

        let again = backend.write(&ctx, "/memories/readme.md", "gamma").await.unwrap();
        assert!(again.error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_assistant_namespace_isolation() {
        let (backend, _store) = backend();
        let a = CallContext::new().with_assistant("agent-a");
        let b = CallContext::new().with_assistant("agent-b");

        backend.write(&a, "/x.txt", "from a").await.unwrap();
        assert_eq!(
            backend.read(&b, "/x.txt", 0, 10).await.unwrap(),
            "Error: File '/x.txt' not found"
        );
        assert_eq!(backend.read(&a, "/x.txt", 0, 10).await.unwrap(), "     1\tfrom a");
    }

    #[tokio::test]
    async fn test_paging_reaches_every_item() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new().with_max_results(7));
        let backend = StoreBackend::new(store).with_page_size(5);
        let ctx = CallContext::new();
        for i in 0..23 {
            backend.write(&ctx, &format!("/f{i:02}.txt"), "needle").await.unwrap();
        }
        let listing = backend.ls(&ctx, "/").await.unwrap();
        assert_eq!(listing.len(), 23);

        let matches = backend.grep_raw(&ctx, "needle", None, None).await.unwrap();
        assert_eq!(matches.len(), 23);
    }

    #[tokio::test]
    async fn test_store_cap_below_page_size_loses_nothing() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new().with_max_results(50));
        let backend = StoreBackend::new(store);
        let ctx = CallContext::new();
        for i in 0..60 {
            backend.write(&ctx, &format!("/notes/n{i:02}.md"), "needle").await.unwrap();
        }

        let listing = backend.ls(&ctx, "/notes").await.unwrap();
        assert_eq!(listing.len(), 60);
        let matches = backend.grep_raw(&ctx, "needle", Some("/"), None).await.unwrap();
        assert_eq!(matches.len(), 60);
        let globbed = backend.glob(&ctx, "**/*.md", "/").await.unwrap();
        assert_eq!(globbed.len(), 60);
    }

    #[tokio::test]
    async fn test_edit_and_invalid_items() {
        let (backend, store) = backend();
        let ctx = CallContext::new();
        backend.write(&ctx, "/a.txt", "one two two").await.unwrap();

        let ambiguous = backend.edit(&ctx, "/a.txt", "two", "2", false).await.unwrap();
        assert!(ambiguous.error.unwrap().contains("appears 2 times"));

        let all = backend.edit(&ctx, "/a.txt", "two", "2", true).await.unwrap();
        assert_eq!(all.occurrences, Some(2));
        assert!(all.files_update.is_none());
        assert_eq!(backend.read(&ctx, "/a.txt", 0, 10).await.unwrap(), "     1\tone 2 2");

        store
            .put(&["filesystem".to_string()], "/bad.txt", json!({"content": "not a list"}))
            .await
            .unwrap();
        assert!(backend.read(&ctx, "/bad.txt", 0, 10).await.unwrap().starts_with("Error:"));
        let listing = backend.ls(&ctx, "/").await.unwrap();
        assert_eq!(listing.len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_store_and_missing_store() {
        let runtime = StoreBackend::from_runtime();
        let err = runtime.ls(&CallContext::new(), "/").await.unwrap_err();
        assert!(matches!(err, BackendError::StoreUnavailable(_)));

        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let ctx = CallContext::new().with_store(&store);
        let res = runtime.write(&ctx, "/r.txt", "x").await.unwrap();
        assert!(res.error.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (backend, _store) = backend();
        let ctx = CallContext::new();
        backend.write(&ctx, "/d.txt", "x").await.unwrap();
        assert!(backend.delete(&ctx, "/d.txt").await.unwrap().error.is_none());
        assert!(backend.delete(&ctx, "/d.txt").await.unwrap().error.is_some());
    }
}
