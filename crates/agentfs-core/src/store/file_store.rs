use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::{page_items, Item, KvStore, SearchQuery};
use crate::error::StoreError;
use crate::util::timestamp;

/// File-based store: one directory per namespace, one JSON file per item.
///
/// Namespace segments and keys are percent-encoded, so `/notes/a.txt` in
/// `["agent", "filesystem"]` lands at `<root>/agent/filesystem/%2Fnotes%2Fa.txt.json`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &[String]) -> Result<PathBuf, StoreError> {
        let mut dir = self.root.clone();
        for segment in namespace {
            if segment.is_empty() {
                return Err(StoreError::InvalidKey(format!("empty namespace segment in {namespace:?}")));
            }
            dir.push(urlencoding::encode(segment).as_ref());
        }
        Ok(dir)
    }

    fn item_path(&self, namespace: &[String], key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        Ok(self
            .namespace_dir(namespace)?
            .join(format!("{}.json", urlencoding::encode(key))))
    }

    fn load(path: &Path) -> Result<Option<Item>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>, StoreError> {
        Self::load(&self.item_path(namespace, key)?)
    }

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let path = self.item_path(namespace, key)?;
        let now = timestamp();
        let created_at = match Self::load(&path) {
            Ok(Some(existing)) => existing.created_at,
            _ => now.clone(),
        };
        let item = Item {
            namespace: namespace.to_vec(),
            key: key.to_string(),
            value,
            created_at,
            updated_at: now,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so readers never see a half-written item.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&item)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool, StoreError> {
        match std::fs::remove_file(self.item_path(namespace, key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn search(&self, namespace: &[String], query: &SearchQuery) -> Result<Vec<Item>, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable store item {}: {}", path.display(), e),
            }
        }
        items.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(page_items(items.iter(), query, usize::MAX))
    }
}
