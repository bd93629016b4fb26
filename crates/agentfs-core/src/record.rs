//! Stored file records and the checkpoint-state reducer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::timestamp;

/// Canonical unit of stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File body split on `\n`.
    pub content: Vec<String>,
    pub created_at: String,
    pub modified_at: String,
}

/// Caller-owned file mapping used by checkpoint backends.
pub type FileState = BTreeMap<String, FileRecord>;

/// Pending state patch. A `None` value deletes the path.
pub type FilesUpdate = BTreeMap<String, Option<FileRecord>>;

impl FileRecord {
    /// Create a record stamped with the current time.
    pub fn new(content: &str) -> Self {
        let now = timestamp();
        Self {
            content: split_content(content),
            created_at: now.clone(),
            modified_at: now,
        }
    }

    /// Replace the body, keeping `created_at` and refreshing `modified_at`.
    pub fn updated(&self, content: &str) -> Self {
        let now = timestamp();
        // Clock skew must not produce modified_at < created_at.
        let modified_at = if now < self.created_at {
            self.created_at.clone()
        } else {
            now
        };
        Self {
            content: split_content(content),
            created_at: self.created_at.clone(),
            modified_at,
        }
    }

    /// The full body joined back into one string.
    pub fn text(&self) -> String {
        self.content.join("\n")
    }

    /// Size in bytes of the joined body.
    pub fn size(&self) -> u64 {
        let newlines = self.content.len().saturating_sub(1);
        (self.content.iter().map(String::len).sum::<usize>() + newlines) as u64
    }
}

fn split_content(content: &str) -> Vec<String> {
    content.split('\n').map(str::to_string).collect()
}

/// Fold a patch into caller state: `Some` inserts or overwrites, `None` removes.
///
/// Tombstones are consumed by the merge and never stored.
pub fn merge_files(state: &mut FileState, update: FilesUpdate) {
    for (path, record) in update {
        match record {
            Some(record) => {
                state.insert(path, record);
            }
            None => {
                state.remove(&path);
            }
        }
    }
}

/// Combine two pending patches; entries from `right` win.
pub fn combine_updates(mut left: FilesUpdate, right: FilesUpdate) -> FilesUpdate {
    left.extend(right);
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_splits_lines() {
        let record = FileRecord::new("a\nb\n");
        assert_eq!(record.content, vec!["a", "b", ""]);
        assert_eq!(record.text(), "a\nb\n");
        assert_eq!(record.created_at, record.modified_at);
        assert_eq!(record.size(), 4);
    }

    #[test]
    fn test_update_preserves_created_at() {
        let record = FileRecord {
            content: vec!["old".into()],
            created_at: "2024-01-01T00:00:00+00:00".into(),
            modified_at: "2024-01-01T00:00:00+00:00".into(),
        };
        let updated = record.updated("new");
        assert_eq!(updated.created_at, record.created_at);
        assert!(updated.modified_at >= updated.created_at);
        assert_eq!(updated.text(), "new");
    }

    #[test]
    fn test_merge_applies_and_drops_tombstones() {
        let mut state = FileState::new();
        state.insert("/keep.txt".into(), FileRecord::new("keep"));
        state.insert("/gone.txt".into(), FileRecord::new("gone"));

        let mut update = FilesUpdate::new();
        update.insert("/gone.txt".into(), None);
        update.insert("/new.txt".into(), Some(FileRecord::new("new")));
        merge_files(&mut state, update);

        assert!(state.contains_key("/keep.txt"));
        assert!(state.contains_key("/new.txt"));
        assert!(!state.contains_key("/gone.txt"));
    }

    #[test]
    fn test_merge_tombstone_for_absent_path_is_noop() {
        let mut state = FileState::new();
        let mut update = FilesUpdate::new();
        update.insert("/never.txt".into(), None);
        merge_files(&mut state, update);
        assert!(state.is_empty());
    }

    #[test]
    fn test_combine_updates_right_wins() {
        let mut left = FilesUpdate::new();
        left.insert("/a".into(), Some(FileRecord::new("1")));
        let mut right = FilesUpdate::new();
        right.insert("/a".into(), None);
        let combined = combine_updates(left, right);
        assert_eq!(combined.get("/a"), Some(&None));
    }

    #[test]
    fn test_record_json_shape() {
        let record = FileRecord::new("x");
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("content").unwrap().is_array());
        assert!(value.get("created_at").unwrap().is_string());
        assert!(value.get("modified_at").unwrap().is_string());
    }
}
