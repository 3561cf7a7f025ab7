//! Ingestion coordinator: drives the warehouse status state machine.
//!
//! One claim at a time: the store atomically flips the winner to Processing
//! (a Processing row left over from a crash wins over Pending), the
//! repository is cloned, its document row created or refreshed, and the
//! document builder generates the initial catalogue bodies. Success moves the
//! warehouse to Completed with a cleared error; any failure moves it to
//! Failed with the captured error text, and the loop cools down before the
//! next poll so one bad repository cannot wedge the pipeline.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analysis::sleep_or_shutdown;
use crate::config::Settings;
use crate::contract::{DocumentBuilder, GitClient, WarehouseStore};
use crate::model::{new_id, Document, Warehouse, WarehouseStatus};

type IngestError = Box<dyn std::error::Error + Send + Sync>;

pub struct IngestionCoordinator {
    store: Arc<dyn WarehouseStore>,
    git: Arc<dyn GitClient>,
    builder: Arc<dyn DocumentBuilder>,
    settings: Settings,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        git: Arc<dyn GitClient>,
        builder: Arc<dyn DocumentBuilder>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            git,
            builder,
            settings,
        }
    }

    /// Worker loop. Processes one warehouse fully before claiming the next;
    /// throughput scales by running more coordinator instances on disjoint
    /// partitions, not by fan-out inside this loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Ingestion coordinator started");
        while !shutdown.is_cancelled() {
            match self.store.claim_next_warehouse().await {
                Ok(Some(warehouse)) => {
                    info!(
                        warehouse_id = %warehouse.id,
                        address = %warehouse.address,
                        "Claimed warehouse for ingestion"
                    );
                    match self.ingest(&warehouse).await {
                        Ok(head) => {
                            self.finish(&warehouse.id, WarehouseStatus::Completed, String::new())
                                .await;
                            info!(
                                warehouse_id = %warehouse.id,
                                head = %head,
                                "Ingestion completed"
                            );
                        }
                        Err(e) => {
                            let message = e.to_string();
                            error!(
                                warehouse_id = %warehouse.id,
                                error = %message,
                                "Ingestion failed"
                            );
                            self.finish(&warehouse.id, WarehouseStatus::Failed, message)
                                .await;
                            sleep_or_shutdown(self.settings.error_cooldown, &shutdown).await;
                        }
                    }
                }
                Ok(None) => {
                    sleep_or_shutdown(self.settings.poll_interval, &shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "Warehouse claim failed");
                    sleep_or_shutdown(self.settings.error_cooldown, &shutdown).await;
                }
            }
        }
        info!("Ingestion coordinator stopped");
    }

    /// Clone, create-or-load the document, delegate the build, record the
    /// head version. Status flips happen in the caller.
    async fn ingest(&self, warehouse: &Warehouse) -> Result<String, IngestError> {
        let outcome = self
            .git
            .clone_repository(
                warehouse.address.clone(),
                warehouse.credentials.clone(),
                warehouse.branch.clone(),
            )
            .await?;

        let document = match self.store.get_document(warehouse.id.clone()).await? {
            Some(mut existing) => {
                existing.git_path = outcome.local_path.clone();
                existing.last_update = Utc::now();
                existing
            }
            None => Document {
                id: new_id(),
                warehouse_id: warehouse.id.clone(),
                git_path: outcome.local_path.clone(),
                last_update: Utc::now(),
            },
        };
        self.store.upsert_document(document.clone()).await?;

        self.builder
            .build_initial(warehouse.clone(), document)
            .await?;

        self.store
            .set_version(warehouse.id.clone(), outcome.head_version.clone())
            .await?;
        Ok(outcome.head_version)
    }

    /// Terminal status flip, guarded on Processing so a racing worker cannot
    /// be overwritten.
    async fn finish(&self, warehouse_id: &str, to: WarehouseStatus, error_text: String) {
        match self
            .store
            .update_status_if(
                warehouse_id.to_string(),
                vec![WarehouseStatus::Processing],
                to,
                error_text,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                error!(warehouse_id, "Status flip refused: warehouse no longer Processing");
            }
            Err(e) => {
                error!(warehouse_id, error = %e, "Failed to record terminal status");
            }
        }
    }
}
