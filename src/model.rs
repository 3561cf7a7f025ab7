//! Persisted entities for the documentation pipeline.
//!
//! All entities live in the [`WarehouseStore`](crate::contract::WarehouseStore);
//! this module only defines the plain data shapes and their lifecycle enums.
//! Catalogue rows are soft-deleted only (`is_deleted` + `deleted_time`) so the
//! incremental diff always has the full history to reconcile against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tracked source repository under management.
///
/// Never hard-deleted; the `status` field is the single source of truth for
/// where the warehouse sits in the ingestion state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: String,
    /// Remote address (git URL or archive location).
    pub address: String,
    pub branch: String,
    /// Last processed commit SHA; empty until the first successful pass.
    pub version: String,
    pub status: WarehouseStatus,
    pub organization: String,
    pub name: String,
    pub credentials: Option<GitCredentials>,
    /// Last failure message; cleared on every successful pass.
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Ingestion state machine: `Pending → Processing → {Completed | Failed}`.
/// Completed warehouses re-enter processing via incremental analysis but
/// never revisit `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarehouseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Credentials handed to the git collaborator for private remotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

/// The local working-copy record associated with a warehouse (1:1).
///
/// `last_update` is refreshed after every analysis pass, successful or not;
/// it gates the next incremental staleness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub warehouse_id: String,
    pub git_path: String,
    pub last_update: DateTime<Utc>,
}

/// One node of the generated documentation tree.
///
/// Siblings under the same parent keep a dense, zero-based `order`. Rows are
/// never physically removed; updates are modelled as soft-delete plus a fresh
/// insert so the audit trail stays complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCatalog {
    pub id: String,
    pub warehouse_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub title: String,
    pub prompt: String,
    pub order: u32,
    pub is_deleted: bool,
    pub deleted_time: Option<DateTime<Utc>>,
}

/// One changelog entry for a warehouse. Append-only; `last_update` drives the
/// "commits since when" cutoff of the next changelog pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCommitRecord {
    pub id: String,
    pub warehouse_id: String,
    pub title: String,
    pub commit_message: String,
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One generated document body under a catalogue node; the unit of
/// file-level translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFileItem {
    pub id: String,
    pub catalog_id: String,
    pub title: String,
    pub description: String,
    pub content: String,
}

/// What a translation task covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranslationTaskType {
    /// Every catalogue node and file item of the warehouse.
    Repository,
    /// A single catalogue subtree identified by `target_id`.
    Catalog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranslationTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TranslationTaskStatus {
    /// Terminal tasks are never restarted in place; re-running work means
    /// enqueueing a fresh task for the same key.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TranslationTaskStatus::Completed
                | TranslationTaskStatus::Failed
                | TranslationTaskStatus::Cancelled
        )
    }
}

/// One trackable, cancellable unit of i18n generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationTask {
    pub id: String,
    pub warehouse_id: String,
    /// Catalogue id when `task_type == Catalog`; `None` for whole-repository
    /// tasks.
    pub target_id: Option<String>,
    pub target_language: String,
    pub source_language: String,
    pub task_type: TranslationTaskType,
    pub status: TranslationTaskStatus,
    pub catalogs_translated: u32,
    pub total_catalogs: u32,
    pub files_translated: u32,
    pub total_files: u32,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranslationTask {
    /// The de-duplication key: at most one task per key may be in flight.
    pub fn key(&self) -> TranslationKey {
        TranslationKey {
            warehouse_id: self.warehouse_id.clone(),
            target_language: self.target_language.clone(),
            task_type: self.task_type,
            target_id: self.target_id.clone(),
        }
    }
}

/// Identity of a unit of translation work, independent of task instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranslationKey {
    pub warehouse_id: String,
    pub target_language: String,
    pub task_type: TranslationTaskType,
    pub target_id: Option<String>,
}

/// Translated name/description of a catalogue node for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCatalogI18n {
    pub catalog_id: String,
    pub language: String,
    pub name: String,
    pub description: String,
}

/// Translated title/description/content of a file item for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFileItemI18n {
    pub file_item_id: String,
    pub language: String,
    pub title: String,
    pub description: String,
    pub content: String,
}

/// Derived knowledge-map artifact, built at most once per warehouse and
/// immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniMap {
    pub id: String,
    pub warehouse_id: String,
    /// JSON-serialised map payload.
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Fresh synthetic id for any entity created by the pipeline.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TranslationTaskStatus::Completed.is_terminal());
        assert!(TranslationTaskStatus::Failed.is_terminal());
        assert!(TranslationTaskStatus::Cancelled.is_terminal());
        assert!(!TranslationTaskStatus::Pending.is_terminal());
        assert!(!TranslationTaskStatus::Running.is_terminal());
    }

    #[test]
    fn translation_key_ignores_progress() {
        let now = Utc::now();
        let mut task = TranslationTask {
            id: new_id(),
            warehouse_id: "w1".into(),
            target_id: None,
            target_language: "ja-JP".into(),
            source_language: "en-US".into(),
            task_type: TranslationTaskType::Repository,
            status: TranslationTaskStatus::Pending,
            catalogs_translated: 0,
            total_catalogs: 0,
            files_translated: 0,
            total_files: 0,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };
        let key = task.key();
        task.catalogs_translated = 7;
        task.status = TranslationTaskStatus::Running;
        assert_eq!(task.key(), key);
    }

    #[test]
    fn translation_keys_work_as_hash_map_keys() {
        use std::collections::HashSet;

        let repo_key = TranslationKey {
            warehouse_id: "w1".into(),
            target_language: "ja-JP".into(),
            task_type: TranslationTaskType::Repository,
            target_id: None,
        };
        let catalog_key = TranslationKey {
            task_type: TranslationTaskType::Catalog,
            target_id: Some("c1".into()),
            ..repo_key.clone()
        };
        let mut seen = HashSet::new();
        assert!(seen.insert(repo_key.clone()));
        assert!(seen.insert(catalog_key));
        assert!(!seen.insert(repo_key), "same key hashes to the same slot");
    }
}
