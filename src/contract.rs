//! # contract: collaborator interfaces for the ingestion pipeline
//!
//! This module defines the seams between the pipeline core and its external
//! collaborators: the git plumbing, the LLM backend, the durable store, and
//! the out-of-scope document/map builders. Each seam is a single async trait
//! with plain request/response data, so the workers can be driven in tests by
//! deterministic mocks.
//!
//! ## Interface & Extensibility
//! - All methods are async and return boxed error trait objects; implementors
//!   convert their upstream failures into those.
//! - Every trait is annotated for `mockall`, and the mocks are exported under
//!   the `test-export-mocks` feature so integration tests can use them.
//!
//! ## Implementations in this crate
//! - [`crate::git::ProcessGitClient`] shells out to `git(1)`.
//! - [`crate::llm::HttpLlmClient`] streams from an OpenAI-compatible API.
//! - [`crate::store::InMemoryStore`] backs the test suite and the demo wiring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::model::{
    Document, DocumentCatalog, DocumentCatalogI18n, DocumentCommitRecord, DocumentFileItem,
    DocumentFileItemI18n, GitCredentials, MiniMap, TranslationKey, TranslationTask, Warehouse,
    WarehouseStatus,
};

pub type GitError = Box<dyn std::error::Error + Send + Sync>;
pub type LlmError = Box<dyn std::error::Error + Send + Sync>;
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;
pub type BuildError = Box<dyn std::error::Error + Send + Sync>;

/// Result of cloning (or re-cloning) a warehouse's remote.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    /// Filesystem path of the local working copy.
    pub local_path: String,
    pub repo_name: String,
    pub organization: String,
    pub branch: String,
    /// Commit SHA the working copy is at after the clone.
    pub head_version: String,
}

/// Result of pulling new history into an existing working copy.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Commits newer than the known version, oldest first. Empty when the
    /// remote has not moved.
    pub commits: Vec<Commit>,
    pub head_version: String,
}

/// One commit of the pulled history.
#[derive(Debug, Clone)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A file touched between two revisions.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl FileChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileChangeKind::Added => "added",
            FileChangeKind::Modified => "modified",
            FileChangeKind::Deleted => "deleted",
            FileChangeKind::Renamed => "renamed",
        }
    }
}

/// Git plumbing collaborator: clone, pull, and per-revision file diffs.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Clone `address` at `branch` into a managed local directory.
    async fn clone_repository(
        &self,
        address: String,
        credentials: Option<GitCredentials>,
        branch: String,
    ) -> Result<CloneOutcome, GitError>;

    /// Fetch new history for an existing working copy and list the commits
    /// since `known_version` (exclusive), oldest first.
    async fn pull_repository(
        &self,
        local_path: String,
        known_version: String,
        branch: String,
        credentials: Option<GitCredentials>,
    ) -> Result<PullOutcome, GitError>;

    /// Files changed between two revisions; for a single commit this is the
    /// diff against its first parent.
    async fn diff_files(
        &self,
        repo_path: String,
        from_rev: String,
        to_rev: String,
    ) -> Result<Vec<FileChange>, GitError>;
}

/// One completion request against the LLM backend.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Streamed completion output; each item is one text chunk.
pub type CompletionStream = BoxStream<'static, Result<String, LlmError>>;

/// LLM collaborator. Responses are streamed so callers can cancel
/// cooperatively between chunks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream_complete(&self, req: CompletionRequest)
        -> Result<CompletionStream, LlmError>;
}

/// How a drafted catalogue node relates to the existing tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChangeKind {
    /// A brand-new node.
    Add,
    /// A replacement for an existing node: the old row (by id) is
    /// soft-deleted before the draft is inserted, never mutated in place.
    Replace(String),
}

/// One drafted catalogue node handed to the document builder.
#[derive(Debug, Clone)]
pub struct CatalogChange {
    pub kind: CatalogChangeKind,
    pub item: DocumentCatalog,
}

/// Out-of-scope collaborator that generates per-node document bodies.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DocumentBuilder: Send + Sync {
    /// Full first-time build of a freshly cloned warehouse.
    async fn build_initial(
        &self,
        warehouse: Warehouse,
        document: Document,
    ) -> Result<(), BuildError>;

    /// Regenerate bodies for the drafted catalogue changes of an incremental
    /// pass.
    async fn build_changes(
        &self,
        warehouse: Warehouse,
        document: Document,
        changes: Vec<CatalogChange>,
    ) -> Result<(), BuildError>;
}

/// Out-of-scope collaborator that produces the knowledge-map JSON for a
/// completed warehouse.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MapBuilder: Send + Sync {
    async fn build_map(
        &self,
        warehouse: Warehouse,
        document: Document,
    ) -> Result<serde_json::Value, BuildError>;
}

/// Durable store for every pipeline entity.
///
/// Claim and status updates are conditional writes: `claim_next_warehouse`
/// atomically flips exactly one candidate row to Processing, and
/// `update_status_if` only writes when the current status matches one of the
/// expected values, returning whether a row was affected. Multiple workers
/// race on the same warehouse rows, so plain read-modify-write is never
/// enough.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    async fn create_warehouse(&self, warehouse: Warehouse) -> Result<(), StoreError>;

    async fn get_warehouse(&self, id: String) -> Result<Option<Warehouse>, StoreError>;

    /// Atomically claim the next warehouse to ingest: a Processing row is
    /// preferred (crash recovery), otherwise the oldest Pending row; the
    /// winner is moved to Processing before it is returned.
    async fn claim_next_warehouse(&self) -> Result<Option<Warehouse>, StoreError>;

    /// Guarded status write: only applies when the current status is one of
    /// `expected`. Returns whether a row was updated.
    async fn update_status_if(
        &self,
        id: String,
        expected: Vec<WarehouseStatus>,
        to: WarehouseStatus,
        error: String,
    ) -> Result<bool, StoreError>;

    /// Record the new last-processed commit SHA.
    async fn set_version(&self, id: String, version: String) -> Result<bool, StoreError>;

    async fn upsert_document(&self, document: Document) -> Result<(), StoreError>;

    async fn get_document(&self, warehouse_id: String) -> Result<Option<Document>, StoreError>;

    /// Refresh `Document.last_update`; gates the next staleness check.
    async fn touch_document(
        &self,
        warehouse_id: String,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Oldest Completed warehouse whose document has not been refreshed since
    /// `cutoff`, together with that document.
    async fn next_stale_completed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<(Warehouse, Document)>, StoreError>;

    /// Current (non-deleted) catalogue rows of a warehouse.
    async fn list_catalogs(
        &self,
        warehouse_id: String,
    ) -> Result<Vec<DocumentCatalog>, StoreError>;

    async fn insert_catalogs(&self, rows: Vec<DocumentCatalog>) -> Result<(), StoreError>;

    /// Soft-delete: flags `is_deleted` and stamps `deleted_time`; rows stay
    /// in the store. Returns how many rows were flagged.
    async fn soft_delete_catalogs(
        &self,
        ids: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn latest_commit_record(
        &self,
        warehouse_id: String,
    ) -> Result<Option<DocumentCommitRecord>, StoreError>;

    async fn insert_commit_records(
        &self,
        rows: Vec<DocumentCommitRecord>,
    ) -> Result<(), StoreError>;

    /// A Pending or Running task for the same key, if any.
    async fn find_active_translation_task(
        &self,
        key: TranslationKey,
    ) -> Result<Option<TranslationTask>, StoreError>;

    async fn create_translation_task(&self, task: TranslationTask) -> Result<(), StoreError>;

    async fn get_translation_task(
        &self,
        id: String,
    ) -> Result<Option<TranslationTask>, StoreError>;

    /// Whole-row task update. Safe because each task has exactly one writer.
    async fn update_translation_task(&self, task: TranslationTask) -> Result<(), StoreError>;

    /// Tasks persisted as Running; used for startup orphan reconciliation.
    async fn list_running_translation_tasks(&self) -> Result<Vec<TranslationTask>, StoreError>;

    async fn list_file_items(
        &self,
        catalog_ids: Vec<String>,
    ) -> Result<Vec<DocumentFileItem>, StoreError>;

    async fn insert_file_items(&self, rows: Vec<DocumentFileItem>) -> Result<(), StoreError>;

    async fn get_catalog_translation(
        &self,
        catalog_id: String,
        language: String,
    ) -> Result<Option<DocumentCatalogI18n>, StoreError>;

    async fn insert_catalog_translation(
        &self,
        row: DocumentCatalogI18n,
    ) -> Result<(), StoreError>;

    async fn get_file_translation(
        &self,
        file_item_id: String,
        language: String,
    ) -> Result<Option<DocumentFileItemI18n>, StoreError>;

    async fn insert_file_translation(&self, row: DocumentFileItemI18n)
        -> Result<(), StoreError>;

    /// Oldest Completed warehouse with no MiniMap row yet.
    async fn oldest_completed_without_map(&self) -> Result<Option<Warehouse>, StoreError>;

    async fn insert_mini_map(&self, map: MiniMap) -> Result<(), StoreError>;

    async fn get_mini_map(&self, warehouse_id: String) -> Result<Option<MiniMap>, StoreError>;
}
