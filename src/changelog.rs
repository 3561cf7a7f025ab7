//! Changelog generation from new commit history.
//!
//! Commits strictly newer than the newest stored `DocumentCommitRecord` are
//! rendered into a textual log and summarised by the model into release-note
//! entries. Entries are append-only; the timestamp cutoff is the only
//! de-duplication.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Settings;
use crate::contract::{Commit, CompletionRequest, LlmClient, StoreError, WarehouseStore};
use crate::extract::{parse_payload, ExtractError};
use crate::llm::{collect_completion, CompletionError};
use crate::model::{new_id, DocumentCommitRecord, Warehouse};
use crate::retry::{retry, RetryError};

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("changelog generation cancelled")]
    Cancelled,
    #[error("model output did not summarise into changelog entries: {0}")]
    Summarise(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

/// One summarised entry as returned by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangelogEntry {
    pub date: String,
    pub title: String,
    pub description: String,
}

pub struct ChangelogGenerator {
    store: Arc<dyn WarehouseStore>,
    llm: Arc<dyn LlmClient>,
    settings: Settings,
}

impl ChangelogGenerator {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        llm: Arc<dyn LlmClient>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            llm,
            settings,
        }
    }

    /// Summarise the given commits into commit records and persist them.
    ///
    /// Commits at or before the stored cutoff are skipped; with nothing newer
    /// this is a no-op returning an empty list.
    pub async fn generate(
        &self,
        warehouse: &Warehouse,
        commits: &[Commit],
        cancel: &CancellationToken,
    ) -> Result<Vec<DocumentCommitRecord>, ChangelogError> {
        let cutoff = self
            .store
            .latest_commit_record(warehouse.id.clone())
            .await
            .map_err(ChangelogError::Store)?
            .map(|r| r.last_update);

        let fresh: Vec<&Commit> = match cutoff {
            Some(cutoff) => commits.iter().filter(|c| c.timestamp > cutoff).collect(),
            None => commits.iter().collect(),
        };
        if fresh.is_empty() {
            debug!(warehouse_id = %warehouse.id, "No commits newer than changelog cutoff");
            return Ok(Vec::new());
        }

        let log = fresh
            .iter()
            .map(|c| format!("{} | {} | {}", c.author, c.timestamp.to_rfc3339(), c.message))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = changelog_prompt(warehouse, &log);

        let llm = Arc::clone(&self.llm);
        let timeout = self.settings.llm_timeout;
        let entries = retry(self.settings.retry, cancel, "changelog-summarise", || {
            let llm = Arc::clone(&llm);
            let prompt = prompt.clone();
            async move {
                let text = collect_completion(
                    llm.as_ref(),
                    CompletionRequest {
                        prompt,
                        ..Default::default()
                    },
                    cancel,
                    timeout,
                )
                .await?;
                parse_payload::<Vec<ChangelogEntry>>(&text, "changelog")
                    .map_err(SummariseAttemptError::Parse)
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled
            | RetryError::Exhausted {
                last: SummariseAttemptError::Llm(CompletionError::Cancelled),
                ..
            } => ChangelogError::Cancelled,
            RetryError::Exhausted { attempts, last } => {
                ChangelogError::Summarise(format!("{attempts} attempts: {last}"))
            }
        })?;

        // All records of one pass share the newest covered commit timestamp,
        // so the next cutoff query excludes exactly these commits.
        let newest = fresh
            .iter()
            .map(|c| c.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        let now = Utc::now();
        let records: Vec<DocumentCommitRecord> = entries
            .into_iter()
            .map(|entry| DocumentCommitRecord {
                id: new_id(),
                warehouse_id: warehouse.id.clone(),
                title: entry.title,
                commit_message: format!("{}: {}", entry.date, entry.description),
                last_update: newest,
                created_at: now,
            })
            .collect();
        self.store
            .insert_commit_records(records.clone())
            .await
            .map_err(ChangelogError::Store)?;
        info!(
            warehouse_id = %warehouse.id,
            entries = records.len(),
            "Appended changelog records"
        );
        Ok(records)
    }
}

#[derive(Debug, Error)]
enum SummariseAttemptError {
    #[error(transparent)]
    Llm(#[from] CompletionError),
    #[error(transparent)]
    Parse(#[from] ExtractError),
}

fn changelog_prompt(warehouse: &Warehouse, log: &str) -> String {
    format!(
        "You are writing release notes for the repository {}/{} (branch {}).\n\
         Summarise the following commit log into a JSON array of objects with\n\
         the fields \"date\", \"title\" and \"description\". Wrap the array in\n\
         <changelog></changelog> tags.\n\nCommit log:\n{}",
        warehouse.organization, warehouse.name, warehouse.branch, log
    )
}
