use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analysis::AnalysisEngine;
use crate::config::Settings;
use crate::contract::{BuildError, CatalogChange, DocumentBuilder, MapBuilder, WarehouseStore};
use crate::coordinator::IngestionCoordinator;
use crate::git::ProcessGitClient;
use crate::llm::HttpLlmClient;
use crate::minimap::MiniMapWorker;
use crate::model::{new_id, Document, Warehouse, WarehouseStatus};
use crate::store::InMemoryStore;
use crate::translation::TranslationManager;

/// CLI for repo-wiki: ingest repositories and maintain their documentation.
#[derive(Parser)]
#[clap(
    name = "repo-wiki",
    version,
    about = "Ingest git repositories and keep an LLM-maintained documentation catalogue up to date"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline workers until interrupted
    Serve {
        /// Directory for local working copies
        #[clap(long, default_value = "./repos")]
        workdir: PathBuf,
        /// Repository to track, as ADDRESS or ADDRESS#BRANCH (repeatable)
        #[clap(long = "repo")]
        repos: Vec<String>,
    },
}

/// Demo document builder: records what it was asked to build.
struct LoggingDocumentBuilder;

#[async_trait]
impl DocumentBuilder for LoggingDocumentBuilder {
    async fn build_initial(
        &self,
        warehouse: Warehouse,
        document: Document,
    ) -> Result<(), BuildError> {
        info!(
            warehouse_id = %warehouse.id,
            git_path = %document.git_path,
            "Initial document build requested"
        );
        Ok(())
    }

    async fn build_changes(
        &self,
        warehouse: Warehouse,
        _document: Document,
        changes: Vec<CatalogChange>,
    ) -> Result<(), BuildError> {
        info!(
            warehouse_id = %warehouse.id,
            changes = changes.len(),
            "Catalogue change build requested"
        );
        Ok(())
    }
}

/// Demo map builder: a flat directory listing of the working copy.
struct DirectoryMapBuilder;

#[async_trait]
impl MapBuilder for DirectoryMapBuilder {
    async fn build_map(
        &self,
        warehouse: Warehouse,
        document: Document,
    ) -> Result<serde_json::Value, BuildError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&document.git_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(serde_json::json!({
            "repository": format!("{}/{}", warehouse.organization, warehouse.name),
            "entries": entries,
        }))
    }
}

/// Extracted async CLI entrypoint for integration tests and main().
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");
    match cli.command {
        Commands::Serve { workdir, repos } => serve(workdir, repos).await,
    }
}

async fn serve(workdir: PathBuf, repos: Vec<String>) -> Result<()> {
    let settings = Settings::from_env();
    let store = Arc::new(InMemoryStore::new());
    let git = Arc::new(ProcessGitClient::new(workdir));
    let llm = Arc::new(HttpLlmClient::from_env().map_err(|e| anyhow::anyhow!("{e}"))?);
    let doc_builder = Arc::new(LoggingDocumentBuilder);
    let map_builder = Arc::new(DirectoryMapBuilder);

    for entry in &repos {
        let (address, branch) = match entry.split_once('#') {
            Some((a, b)) => (a.to_string(), b.to_string()),
            None => (entry.clone(), "main".to_string()),
        };
        let warehouse = submission(address, branch);
        info!(warehouse_id = %warehouse.id, address = %warehouse.address, "Tracking repository");
        store
            .create_warehouse(warehouse)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let translation = TranslationManager::new(store.clone(), llm.clone(), settings.clone());
    let orphaned = translation
        .reconcile_orphans()
        .await
        .context("orphan reconciliation failed")?;
    if orphaned > 0 {
        info!(orphaned, "Reconciled orphaned translation tasks");
    }

    let shutdown = CancellationToken::new();
    let coordinator = Arc::new(IngestionCoordinator::new(
        store.clone(),
        git.clone(),
        doc_builder.clone(),
        settings.clone(),
    ));
    let analysis = Arc::new(AnalysisEngine::new(
        store.clone(),
        git,
        llm,
        doc_builder,
        settings.clone(),
    ));
    let minimap = Arc::new(MiniMapWorker::new(store, map_builder, settings));

    let mut workers = Vec::new();
    {
        let coordinator = coordinator.clone();
        let token = shutdown.clone();
        workers.push(tokio::spawn(async move { coordinator.run(token).await }));
    }
    {
        let analysis = analysis.clone();
        let token = shutdown.clone();
        workers.push(tokio::spawn(async move { analysis.run(token).await }));
    }
    {
        let minimap = minimap.clone();
        let token = shutdown.clone();
        workers.push(tokio::spawn(async move { minimap.run(token).await }));
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received, stopping workers");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

/// A freshly submitted warehouse, status Pending.
fn submission(address: String, branch: String) -> Warehouse {
    Warehouse {
        id: new_id(),
        address,
        branch,
        version: String::new(),
        status: WarehouseStatus::Pending,
        organization: String::new(),
        name: String::new(),
        credentials: None,
        error: String::new(),
        created_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_map_lists_working_copy_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let warehouse = submission("https://github.com/acme/widgets.git".into(), "main".into());
        let document = Document {
            id: new_id(),
            warehouse_id: warehouse.id.clone(),
            git_path: dir.path().to_string_lossy().to_string(),
            last_update: chrono::Utc::now(),
        };
        let map = DirectoryMapBuilder
            .build_map(warehouse, document)
            .await
            .unwrap();
        assert_eq!(map["entries"], serde_json::json!(["README.md", "src"]));
    }

    #[test]
    fn repo_argument_splits_optional_branch() {
        let warehouse = submission("https://github.com/acme/widgets.git".into(), "dev".into());
        assert_eq!(warehouse.branch, "dev");
        assert_eq!(warehouse.status, WarehouseStatus::Pending);
        assert!(warehouse.version.is_empty());
    }
}
