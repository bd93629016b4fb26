pub mod file_store;
pub mod memory_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use file_store::JsonFileStore;
pub use memory_store::InMemoryStore;

/// A value stored under a namespace and key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Paged key lookup within one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub key_prefix: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchQuery {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            key_prefix: None,
            limit,
            offset,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

/// Trait for namespaced key-value stores that outlive a conversation.
///
/// `search` returns items ordered by key. Implementations may cap the number
/// of items per call below the requested `limit`; callers page with `offset`
/// until an empty page.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch one item.
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>, StoreError>;

    /// Insert or overwrite an item.
    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Remove an item. Returns whether it existed.
    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool, StoreError>;

    /// List items in a namespace.
    async fn search(&self, namespace: &[String], query: &SearchQuery) -> Result<Vec<Item>, StoreError>;
}

/// Apply prefix filter, ordering and paging to a key-ordered item stream.
pub(crate) fn page_items<'a>(
    items: impl Iterator<Item = &'a Item>,
    query: &SearchQuery,
    cap: usize,
) -> Vec<Item> {
    items
        .filter(|item| match &query.key_prefix {
            Some(prefix) => item.key.starts_with(prefix.as_str()),
            None => true,
        })
        .skip(query.offset)
        .take(query.limit.min(cap))
        .cloned()
        .collect()
}
