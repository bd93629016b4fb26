use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{page_items, Item, KvStore, SearchQuery};
use crate::error::StoreError;
use crate::util::timestamp;

/// Per-call result cap applied by [`InMemoryStore::search`].
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Lock-free in-process store.
pub struct InMemoryStore {
    namespaces: DashMap<Vec<String>, BTreeMap<String, Item>>,
    max_results: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    /// Cap the number of items any single search returns.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Number of items across all namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>, StoreError> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|items| items.get(key).cloned()))
    }

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = timestamp();
        let mut items = self.namespaces.entry(namespace.to_vec()).or_default();
        let created_at = items
            .get(key)
            .map(|existing| existing.created_at.clone())
            .unwrap_or_else(|| now.clone());
        items.insert(
            key.to_string(),
            Item {
                namespace: namespace.to_vec(),
                key: key.to_string(),
                value,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool, StoreError> {
        Ok(self
            .namespaces
            .get_mut(namespace)
            .map(|mut items| items.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn search(&self, namespace: &[String], query: &SearchQuery) -> Result<Vec<Item>, StoreError> {
        Ok(match self.namespaces.get(namespace) {
            Some(items) => page_items(items.values(), query, self.max_results),
            None => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryStore::new();
        let namespace = ns(&["filesystem"]);
        store.put(&namespace, "/a.txt", json!({"x": 1})).await.unwrap();

        let item = store.get(&namespace, "/a.txt").await.unwrap().unwrap();
        assert_eq!(item.value, json!({"x": 1}));
        assert!(store.get(&ns(&["other"]), "/a.txt").await.unwrap().is_none());

        assert!(store.delete(&namespace, "/a.txt").await.unwrap());
        assert!(!store.delete(&namespace, "/a.txt").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_put_keeps_created_at() {
        let store = InMemoryStore::new();
        let namespace = ns(&["filesystem"]);
        store.put(&namespace, "/a", json!(1)).await.unwrap();
        let first = store.get(&namespace, "/a").await.unwrap().unwrap();
        store.put(&namespace, "/a", json!(2)).await.unwrap();
        let second = store.get(&namespace, "/a").await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.value, json!(2));
    }

    #[tokio::test]
    async fn test_search_pages_and_caps() {
        let store = InMemoryStore::new().with_max_results(3);
        let namespace = ns(&["filesystem"]);
        for i in 0..5 {
            store.put(&namespace, &format!("/f{i}"), json!(i)).await.unwrap();
        }

        let first = store.search(&namespace, &SearchQuery::page(10, 0)).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].key, "/f0");

        let rest = store.search(&namespace, &SearchQuery::page(10, 3)).await.unwrap();
        assert_eq!(rest.len(), 2);

        let filtered = store
            .search(&namespace, &SearchQuery::page(10, 0).with_prefix("/f4"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }
}
