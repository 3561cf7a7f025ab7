//! Incremental analysis: diff-driven catalogue reconciliation.
//!
//! A Completed warehouse whose document has gone stale is pulled, the commits
//! since its last processed version are summarised into a diff context, and
//! the model is asked for a structured catalogue delta. The delta is
//! reconciled against the existing tree: deletions are soft-deletes, updates
//! are modelled as soft-delete plus a fresh insert (never in-place mutation),
//! and every drafted node is handed to the document builder for body
//! generation.
//!
//! Only the LLM call + parse step is retried (3 attempts, exponential
//! backoff). Git and store failures abort the pass with `Warehouse.version`
//! unchanged, so the next poll retries from the same baseline.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::changelog::{ChangelogError, ChangelogGenerator};
use crate::config::Settings;
use crate::contract::{
    BuildError, CatalogChange, CatalogChangeKind, Commit, CompletionRequest, DocumentBuilder,
    FileChange, GitClient, GitError, LlmClient, StoreError, WarehouseStore,
};
use crate::extract::{parse_payload, ExtractError};
use crate::llm::{collect_completion, CompletionError};
use crate::model::{new_id, Document, DocumentCatalog, Warehouse};
use crate::retry::{retry, RetryError};

/// Result of one incremental pass.
#[derive(Debug)]
pub enum PassOutcome {
    /// No commits since the last processed version; nothing to do.
    NoChanges,
    /// Catalogue reconciled and changelog regenerated up to `head_version`.
    Updated {
        head_version: String,
        drafted: usize,
        deleted: u64,
    },
    /// Shutdown fired mid-pass; durable state is at the last safe checkpoint.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("git operation failed: {0}")]
    Git(GitError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("catalogue planning failed: {0}")]
    Plan(String),
    #[error("document build failed: {0}")]
    Build(BuildError),
    #[error(transparent)]
    Changelog(ChangelogError),
}

/// The structured delta requested from the model.
#[derive(Debug, Deserialize)]
struct CatalogueDelta {
    #[serde(default)]
    delete_id: Vec<String>,
    #[serde(default)]
    items: Vec<DeltaItem>,
}

#[derive(Debug, Deserialize)]
struct DeltaItem {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    children: Vec<DeltaItem>,
}

pub struct AnalysisEngine {
    store: Arc<dyn WarehouseStore>,
    git: Arc<dyn GitClient>,
    llm: Arc<dyn LlmClient>,
    builder: Arc<dyn DocumentBuilder>,
    changelog: ChangelogGenerator,
    settings: Settings,
}

impl AnalysisEngine {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        git: Arc<dyn GitClient>,
        llm: Arc<dyn LlmClient>,
        builder: Arc<dyn DocumentBuilder>,
        settings: Settings,
    ) -> Self {
        let changelog =
            ChangelogGenerator::new(Arc::clone(&store), Arc::clone(&llm), settings.clone());
        Self {
            store,
            git,
            llm,
            builder,
            changelog,
            settings,
        }
    }

    /// Worker loop: one stale warehouse per iteration, oldest first.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.settings.incremental_enabled {
            info!("Incremental analysis disabled by settings, worker not started");
            return;
        }
        info!("Incremental analysis worker started");
        while !shutdown.is_cancelled() {
            let cutoff = Utc::now() - self.settings.staleness_window();
            match self.store.next_stale_completed(cutoff).await {
                Ok(Some((warehouse, document))) => {
                    let outcome = self.run_pass(&warehouse, &document, &shutdown).await;
                    // Refreshed after every pass, success or not; this gates
                    // the next staleness check.
                    if let Err(e) = self
                        .store
                        .touch_document(warehouse.id.clone(), Utc::now())
                        .await
                    {
                        error!(warehouse_id = %warehouse.id, error = %e, "Failed to refresh document timestamp");
                    }
                    match outcome {
                        Ok(PassOutcome::Updated {
                            head_version,
                            drafted,
                            deleted,
                        }) => {
                            if let Err(e) = self
                                .store
                                .set_version(warehouse.id.clone(), head_version.clone())
                                .await
                            {
                                error!(warehouse_id = %warehouse.id, error = %e, "Failed to record new version");
                            }
                            info!(
                                warehouse_id = %warehouse.id,
                                head = %head_version,
                                drafted,
                                deleted,
                                "Incremental pass updated catalogue"
                            );
                        }
                        Ok(PassOutcome::NoChanges) => {
                            debug!(warehouse_id = %warehouse.id, "No new commits, pass was a no-op");
                        }
                        Ok(PassOutcome::Cancelled) => {
                            info!(warehouse_id = %warehouse.id, "Incremental pass cancelled");
                        }
                        Err(e) => {
                            error!(warehouse_id = %warehouse.id, error = %e, "Incremental pass failed");
                            sleep_or_shutdown(self.settings.error_cooldown, &shutdown).await;
                        }
                    }
                }
                Ok(None) => {
                    sleep_or_shutdown(self.settings.poll_interval, &shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "Stale-warehouse scan failed");
                    sleep_or_shutdown(self.settings.error_cooldown, &shutdown).await;
                }
            }
        }
        info!("Incremental analysis worker stopped");
    }

    /// One full incremental pass over a single warehouse.
    pub async fn run_pass(
        &self,
        warehouse: &Warehouse,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, AnalysisError> {
        let pull = self
            .git
            .pull_repository(
                document.git_path.clone(),
                warehouse.version.clone(),
                warehouse.branch.clone(),
                warehouse.credentials.clone(),
            )
            .await
            .map_err(AnalysisError::Git)?;
        if pull.commits.is_empty() {
            return Ok(PassOutcome::NoChanges);
        }
        info!(
            warehouse_id = %warehouse.id,
            commits = pull.commits.len(),
            head = %pull.head_version,
            "New commits since last processed version"
        );

        let diff_context = self
            .render_diff_context(&document.git_path, &pull.commits)
            .await
            .map_err(AnalysisError::Git)?;

        let existing = self
            .store
            .list_catalogs(warehouse.id.clone())
            .await
            .map_err(AnalysisError::Store)?;

        let delta = match self.plan_delta(warehouse, &existing, &diff_context, cancel).await {
            Ok(delta) => delta,
            Err(PlanFailure::Cancelled) => return Ok(PassOutcome::Cancelled),
            Err(PlanFailure::Exhausted(detail)) => return Err(AnalysisError::Plan(detail)),
        };

        let now = Utc::now();
        let mut deleted = 0;
        if !delta.delete_id.is_empty() {
            deleted = self
                .store
                .soft_delete_catalogs(delta.delete_id.clone(), now)
                .await
                .map_err(AnalysisError::Store)?;
            debug!(warehouse_id = %warehouse.id, deleted, "Soft-deleted catalogue nodes");
        }

        let changes = draft_changes(&delta.items, None, &warehouse.id);
        // Replace is delete-then-insert: the superseded row is flagged before
        // the fresh draft lands, keeping the full audit trail.
        let replaced: Vec<String> = changes
            .iter()
            .filter_map(|c| match &c.kind {
                CatalogChangeKind::Replace(old_id) => Some(old_id.clone()),
                CatalogChangeKind::Add => None,
            })
            .collect();
        if !replaced.is_empty() {
            deleted += self
                .store
                .soft_delete_catalogs(replaced, now)
                .await
                .map_err(AnalysisError::Store)?;
        }
        if !changes.is_empty() {
            self.store
                .insert_catalogs(changes.iter().map(|c| c.item.clone()).collect())
                .await
                .map_err(AnalysisError::Store)?;
            self.builder
                .build_changes(warehouse.clone(), document.clone(), changes.clone())
                .await
                .map_err(AnalysisError::Build)?;
        }

        match self
            .changelog
            .generate(warehouse, &pull.commits, cancel)
            .await
        {
            Ok(_) => {}
            Err(ChangelogError::Cancelled) => return Ok(PassOutcome::Cancelled),
            Err(e) => return Err(AnalysisError::Changelog(e)),
        }

        Ok(PassOutcome::Updated {
            head_version: pull.head_version,
            drafted: changes.len(),
            deleted,
        })
    }

    /// Commit messages plus per-commit changed files, concatenated into one
    /// prompt context block.
    async fn render_diff_context(
        &self,
        git_path: &str,
        commits: &[Commit],
    ) -> Result<String, GitError> {
        let mut context = String::new();
        for commit in commits {
            let files = self
                .git
                .diff_files(
                    git_path.to_string(),
                    format!("{}^", commit.sha),
                    commit.sha.clone(),
                )
                .await?;
            context.push_str(&format!(
                "commit {} by {}\n{}\n",
                commit.sha, commit.author, commit.message
            ));
            for FileChange { path, kind } in &files {
                context.push_str(&format!("  {} {}\n", kind.as_str(), path));
            }
            context.push('\n');
        }
        Ok(context)
    }

    /// The retried LLM call + extraction + parse step.
    async fn plan_delta(
        &self,
        warehouse: &Warehouse,
        existing: &[DocumentCatalog],
        diff_context: &str,
        cancel: &CancellationToken,
    ) -> Result<CatalogueDelta, PlanFailure> {
        let catalogue_json = serde_json::to_string_pretty(
            &existing
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "parent_id": c.parent_id,
                        "title": c.title,
                        "name": c.name,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let prompt = plan_prompt(warehouse, &catalogue_json, diff_context);

        let llm = Arc::clone(&self.llm);
        let timeout = self.settings.llm_timeout;
        retry(self.settings.retry, cancel, "catalogue-plan", || {
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
                parse_payload::<CatalogueDelta>(&text, "document_structure")
                    .map_err(PlanAttemptError::Parse)
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled
            | RetryError::Exhausted {
                last: PlanAttemptError::Llm(CompletionError::Cancelled),
                ..
            } => PlanFailure::Cancelled,
            RetryError::Exhausted { attempts, last } => {
                PlanFailure::Exhausted(format!("{attempts} attempts: {last}"))
            }
        })
    }
}

enum PlanFailure {
    Cancelled,
    Exhausted(String),
}

#[derive(Debug, Error)]
enum PlanAttemptError {
    #[error(transparent)]
    Llm(#[from] CompletionError),
    #[error(transparent)]
    Parse(#[from] ExtractError),
}

/// Depth-first walk over the returned item tree. Siblings get a dense,
/// zero-based `order`; every draft gets a fresh id, and `update` items carry
/// the superseded row id as `Replace(old_id)`.
fn draft_changes(
    items: &[DeltaItem],
    parent_id: Option<String>,
    warehouse_id: &str,
) -> Vec<CatalogChange> {
    let mut out = Vec::new();
    walk(items, parent_id, warehouse_id, &mut out);
    out
}

fn walk(
    items: &[DeltaItem],
    parent_id: Option<String>,
    warehouse_id: &str,
    out: &mut Vec<CatalogChange>,
) {
    for (order, item) in items.iter().enumerate() {
        let draft_id = new_id();
        let kind = match (&item.kind[..], &item.id) {
            ("update", Some(old_id)) => CatalogChangeKind::Replace(old_id.clone()),
            (other, _) => {
                if other != "add" && !other.is_empty() {
                    warn!(kind = other, title = %item.title, "Unknown delta item type, treating as add");
                }
                CatalogChangeKind::Add
            }
        };
        let name = if item.name.is_empty() {
            item.title.to_lowercase().replace(' ', "-")
        } else {
            item.name.clone()
        };
        out.push(CatalogChange {
            kind,
            item: DocumentCatalog {
                id: draft_id.clone(),
                warehouse_id: warehouse_id.to_string(),
                parent_id: parent_id.clone(),
                name,
                title: item.title.clone(),
                prompt: item.prompt.clone(),
                order: order as u32,
                is_deleted: false,
                deleted_time: None,
            },
        });
        walk(&item.children, Some(draft_id), warehouse_id, out);
    }
}

fn plan_prompt(warehouse: &Warehouse, catalogue_json: &str, diff_context: &str) -> String {
    format!(
        "You maintain the documentation catalogue for the repository {} (branch {}).\n\
         Given the existing catalogue and the recent git changes, respond with a JSON\n\
         object {{\"delete_id\": [...], \"items\": [...]}} where items form a tree of\n\
         {{\"id\", \"title\", \"name\", \"type\": \"add\"|\"update\", \"prompt\", \"children\"}}.\n\
         Wrap the object in <document_structure></document_structure> tags.\n\n\
         Existing catalogue:\n{}\n\nGit changes:\n{}",
        warehouse.address, warehouse.branch, catalogue_json, diff_context
    )
}

/// Sleep that wakes early on shutdown.
pub(crate) async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
