//! Translation task manager: cancellable, progress-tracked i18n jobs.
//!
//! Tasks are keyed by (warehouse, target language, task type, target id);
//! at most one task per key is ever in flight. Execution walks the
//! warehouse's catalogue nodes and then the file items beneath them, skipping
//! any unit that already has a translation row for the target language, so a
//! re-run never repeats completed work. Progress counters are persisted after
//! every unit.
//!
//! Cancellation is two-channel: a live per-task token in the in-process
//! registry, and the task's persisted status (another actor may flag it
//! Cancelled in the store). Either stops the loop before the next unit; an
//! in-flight completion for a single field is not torn down mid-write, but no
//! new unit starts after the signal.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::contract::{CompletionRequest, LlmClient, StoreError, WarehouseStore};
use crate::llm::{collect_completion, CompletionError};
use crate::model::{
    new_id, DocumentCatalog, DocumentCatalogI18n, DocumentFileItemI18n, TranslationKey,
    TranslationTask, TranslationTaskStatus, TranslationTaskType,
};

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("unknown translation task {0}")]
    UnknownTask(String),
    #[error("task {id} is {status:?}, not runnable")]
    NotRunnable {
        id: String,
        status: TranslationTaskStatus,
    },
}

/// Terminal result of running one task.
#[derive(Debug)]
pub enum TranslationOutcome {
    Completed { catalogs: u32, files: u32 },
    Cancelled { reason: String },
}

/// Request to enqueue translation work.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub warehouse_id: String,
    pub target_id: Option<String>,
    pub target_language: String,
    pub source_language: String,
    pub task_type: TranslationTaskType,
}

pub struct TranslationManager {
    store: Arc<dyn WarehouseStore>,
    llm: Arc<dyn LlmClient>,
    settings: Settings,
    /// Live cancellation sources, keyed by task id. Rebuilt empty on process
    /// start; never survives a restart.
    registry: Mutex<HashMap<String, CancellationToken>>,
    /// Serialises the check-then-create step of `enqueue`.
    enqueue_lock: tokio::sync::Mutex<()>,
}

impl TranslationManager {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        llm: Arc<dyn LlmClient>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            llm,
            settings,
            registry: Mutex::new(HashMap::new()),
            enqueue_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Startup reconciliation: tasks persisted as Running belong to a dead
    /// process. They are forced to Failed; their progress counters and
    /// already-written translation rows are kept, so re-enqueueing the same
    /// key resumes where they stopped without repeating work.
    pub async fn reconcile_orphans(&self) -> Result<u32, TranslationError> {
        let running = self
            .store
            .list_running_translation_tasks()
            .await
            .map_err(TranslationError::Store)?;
        let mut reconciled = 0;
        for mut task in running {
            task.status = TranslationTaskStatus::Failed;
            task.error_message = "orphaned: task was running when the process stopped".to_string();
            task.updated_at = Utc::now();
            warn!(
                task_id = %task.id,
                catalogs_translated = task.catalogs_translated,
                "Marking orphaned translation task as failed"
            );
            self.store
                .update_translation_task(task)
                .await
                .map_err(TranslationError::Store)?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Create a task for the key, or return the one already in flight.
    pub async fn enqueue(
        &self,
        req: TranslationRequest,
    ) -> Result<TranslationTask, TranslationError> {
        let _guard = self.enqueue_lock.lock().await;
        let key = TranslationKey {
            warehouse_id: req.warehouse_id.clone(),
            target_language: req.target_language.clone(),
            task_type: req.task_type,
            target_id: req.target_id.clone(),
        };
        if let Some(existing) = self
            .store
            .find_active_translation_task(key)
            .await
            .map_err(TranslationError::Store)?
        {
            info!(
                task_id = %existing.id,
                status = ?existing.status,
                "Reusing in-flight translation task for key"
            );
            return Ok(existing);
        }
        let now = Utc::now();
        let task = TranslationTask {
            id: new_id(),
            warehouse_id: req.warehouse_id,
            target_id: req.target_id,
            target_language: req.target_language,
            source_language: req.source_language,
            task_type: req.task_type,
            status: TranslationTaskStatus::Pending,
            catalogs_translated: 0,
            total_catalogs: 0,
            files_translated: 0,
            total_files: 0,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_translation_task(task.clone())
            .await
            .map_err(TranslationError::Store)?;
        info!(task_id = %task.id, language = %task.target_language, "Enqueued translation task");
        Ok(task)
    }

    /// Flag a task Cancelled in the store and fire its live token, if the
    /// task is still cancellable.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<bool, TranslationError> {
        let Some(mut task) = self
            .store
            .get_translation_task(task_id.to_string())
            .await
            .map_err(TranslationError::Store)?
        else {
            return Err(TranslationError::UnknownTask(task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TranslationTaskStatus::Cancelled;
        task.error_message = reason.to_string();
        task.updated_at = Utc::now();
        self.store
            .update_translation_task(task)
            .await
            .map_err(TranslationError::Store)?;
        if let Some(token) = self.registry.lock().unwrap().get(task_id) {
            token.cancel();
        }
        info!(task_id, reason, "Translation task cancelled");
        Ok(true)
    }

    /// Execute one Pending task to a terminal status.
    pub async fn run_task(
        &self,
        task_id: &str,
        shutdown: &CancellationToken,
    ) -> Result<TranslationOutcome, TranslationError> {
        let token = CancellationToken::new();
        self.registry
            .lock()
            .unwrap()
            .insert(task_id.to_string(), token.clone());
        let result = self.execute(task_id, &token, shutdown).await;
        self.registry.lock().unwrap().remove(task_id);
        result
    }

    async fn execute(
        &self,
        task_id: &str,
        token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<TranslationOutcome, TranslationError> {
        let Some(mut task) = self
            .store
            .get_translation_task(task_id.to_string())
            .await
            .map_err(TranslationError::Store)?
        else {
            return Err(TranslationError::UnknownTask(task_id.to_string()));
        };
        if task.status != TranslationTaskStatus::Pending {
            return Err(TranslationError::NotRunnable {
                id: task.id,
                status: task.status,
            });
        }

        let catalogs = self.task_catalogs(&task).await?;
        let catalog_ids: Vec<String> = catalogs.iter().map(|c| c.id.clone()).collect();
        let file_items = self
            .store
            .list_file_items(catalog_ids)
            .await
            .map_err(TranslationError::Store)?;

        task.status = TranslationTaskStatus::Running;
        task.total_catalogs = catalogs.len() as u32;
        task.total_files = file_items.len() as u32;
        task.updated_at = Utc::now();
        self.persist(&task).await?;
        info!(
            task_id = %task.id,
            language = %task.target_language,
            total_catalogs = task.total_catalogs,
            total_files = task.total_files,
            "Translation task running"
        );

        for catalog in &catalogs {
            if let Some(reason) = self.cancel_reason(&task.id, token, shutdown).await? {
                return self.finish_cancelled(task, reason).await;
            }
            let existing = self
                .store
                .get_catalog_translation(catalog.id.clone(), task.target_language.clone())
                .await
                .map_err(TranslationError::Store)?;
            if existing.is_none() {
                let (name, description) = match self
                    .translate_catalog(catalog, &task, token)
                    .await
                {
                    Ok(texts) => texts,
                    Err(Interrupted) => {
                        return self
                            .finish_cancelled(task, "cancelled during translation".to_string())
                            .await;
                    }
                };
                self.store
                    .insert_catalog_translation(DocumentCatalogI18n {
                        catalog_id: catalog.id.clone(),
                        language: task.target_language.clone(),
                        name,
                        description,
                    })
                    .await
                    .map_err(TranslationError::Store)?;
            }
            task.catalogs_translated += 1;
            task.updated_at = Utc::now();
            self.persist(&task).await?;
        }

        for item in &file_items {
            if let Some(reason) = self.cancel_reason(&task.id, token, shutdown).await? {
                return self.finish_cancelled(task, reason).await;
            }
            let existing = self
                .store
                .get_file_translation(item.id.clone(), task.target_language.clone())
                .await
                .map_err(TranslationError::Store)?;
            if existing.is_none() {
                let translated = async {
                    Ok::<_, Interrupted>(DocumentFileItemI18n {
                        file_item_id: item.id.clone(),
                        language: task.target_language.clone(),
                        title: self.translate_text(&item.title, &task, token).await?,
                        description: self.translate_text(&item.description, &task, token).await?,
                        content: self.translate_text(&item.content, &task, token).await?,
                    })
                }
                .await;
                match translated {
                    Ok(row) => self
                        .store
                        .insert_file_translation(row)
                        .await
                        .map_err(TranslationError::Store)?,
                    Err(Interrupted) => {
                        return self
                            .finish_cancelled(task, "cancelled during translation".to_string())
                            .await;
                    }
                }
            }
            task.files_translated += 1;
            task.updated_at = Utc::now();
            self.persist(&task).await?;
        }

        task.status = TranslationTaskStatus::Completed;
        task.updated_at = Utc::now();
        let catalogs_done = task.catalogs_translated;
        let files_done = task.files_translated;
        self.persist(&task).await?;
        info!(
            task_id = %task.id,
            catalogs = catalogs_done,
            files = files_done,
            "Translation task completed"
        );
        Ok(TranslationOutcome::Completed {
            catalogs: catalogs_done,
            files: files_done,
        })
    }

    /// The catalogue nodes covered by the task: the whole warehouse, or the
    /// subtree rooted at `target_id` for Catalog tasks.
    async fn task_catalogs(
        &self,
        task: &TranslationTask,
    ) -> Result<Vec<DocumentCatalog>, TranslationError> {
        let all = self
            .store
            .list_catalogs(task.warehouse_id.clone())
            .await
            .map_err(TranslationError::Store)?;
        match (task.task_type, &task.target_id) {
            (TranslationTaskType::Catalog, Some(root)) => Ok(subtree(&all, root)),
            _ => Ok(all),
        }
    }

    async fn cancel_reason(
        &self,
        task_id: &str,
        token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>, TranslationError> {
        if shutdown.is_cancelled() {
            return Ok(Some("shutdown requested".to_string()));
        }
        if token.is_cancelled() {
            return Ok(Some("cancellation requested".to_string()));
        }
        let persisted = self
            .store
            .get_translation_task(task_id.to_string())
            .await
            .map_err(TranslationError::Store)?;
        if matches!(
            persisted.map(|t| t.status),
            Some(TranslationTaskStatus::Cancelled)
        ) {
            return Ok(Some("task flagged cancelled in store".to_string()));
        }
        Ok(None)
    }

    async fn finish_cancelled(
        &self,
        mut task: TranslationTask,
        reason: String,
    ) -> Result<TranslationOutcome, TranslationError> {
        task.status = TranslationTaskStatus::Cancelled;
        task.error_message = reason.clone();
        task.updated_at = Utc::now();
        self.persist(&task).await?;
        info!(
            task_id = %task.id,
            catalogs_translated = task.catalogs_translated,
            reason = %reason,
            "Translation task stopped on cancellation"
        );
        Ok(TranslationOutcome::Cancelled { reason })
    }

    /// Persist the task row. A store-side Cancelled flag written by another
    /// actor survives a concurrent progress update; the next cancellation
    /// check then stops the loop.
    async fn persist(&self, task: &TranslationTask) -> Result<(), TranslationError> {
        let mut row = task.clone();
        if row.status == TranslationTaskStatus::Running {
            let current = self
                .store
                .get_translation_task(row.id.clone())
                .await
                .map_err(TranslationError::Store)?;
            if matches!(
                current.as_ref().map(|t| t.status),
                Some(TranslationTaskStatus::Cancelled)
            ) {
                row.status = TranslationTaskStatus::Cancelled;
                if let Some(current) = current {
                    row.error_message = current.error_message;
                }
            }
        }
        self.store
            .update_translation_task(row)
            .await
            .map_err(TranslationError::Store)
    }

    async fn translate_catalog(
        &self,
        catalog: &DocumentCatalog,
        task: &TranslationTask,
        token: &CancellationToken,
    ) -> Result<(String, String), Interrupted> {
        let name = self.translate_text(&catalog.name, task, token).await?;
        let description = self.translate_text(&catalog.title, task, token).await?;
        Ok((name, description))
    }

    /// Translate one text field. An LLM failure falls back to the source
    /// text (a single bad unit never aborts the task); only cancellation
    /// interrupts.
    async fn translate_text(
        &self,
        text: &str,
        task: &TranslationTask,
        token: &CancellationToken,
    ) -> Result<String, Interrupted> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let prompt = format!(
            "Translate the following text from {} to {}. Output only the translation.\n\n{}",
            task.source_language, task.target_language, text
        );
        match collect_completion(
            self.llm.as_ref(),
            CompletionRequest {
                prompt,
                ..Default::default()
            },
            token,
            self.settings.llm_timeout,
        )
        .await
        {
            Ok(translated) => Ok(translated),
            Err(CompletionError::Cancelled) => Err(Interrupted),
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    error = %e,
                    "Unit translation failed, keeping source text"
                );
                Ok(text.to_string())
            }
        }
    }
}

/// Marker: a unit translation was interrupted by cancellation.
struct Interrupted;

/// `root` plus all its descendants within `all`.
fn subtree(all: &[DocumentCatalog], root: &str) -> Vec<DocumentCatalog> {
    let mut keep: HashSet<&str> = HashSet::new();
    keep.insert(root);
    // Parent pointers only; iterate until the closure stops growing.
    loop {
        let before = keep.len();
        for catalog in all {
            if let Some(parent) = catalog.parent_id.as_deref() {
                if keep.contains(parent) {
                    keep.insert(catalog.id.as_str());
                }
            }
        }
        if keep.len() == before {
            break;
        }
    }
    all.iter()
        .filter(|c| keep.contains(c.id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(id: &str, parent: Option<&str>) -> DocumentCatalog {
        DocumentCatalog {
            id: id.into(),
            warehouse_id: "w1".into(),
            parent_id: parent.map(String::from),
            name: id.into(),
            title: id.to_uppercase(),
            prompt: String::new(),
            order: 0,
            is_deleted: false,
            deleted_time: None,
        }
    }

    #[test]
    fn subtree_collects_descendants_only() {
        let all = vec![
            catalog("a", None),
            catalog("b", Some("a")),
            catalog("c", Some("b")),
            catalog("d", None),
        ];
        let picked = subtree(&all, "a");
        let ids: Vec<&str> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
