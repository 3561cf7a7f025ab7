//! Knowledge-map builder: lazy, best-effort derived artifact.
//!
//! A slow background scan (10 s idle backoff) looks for Completed warehouses
//! without a MiniMap row, oldest first, and builds at most one artifact per
//! cycle. Failures are logged and retried on the next cycle; map generation
//! never flips a warehouse to Failed, since the documentation itself does not
//! depend on it.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analysis::sleep_or_shutdown;
use crate::config::Settings;
use crate::contract::{MapBuilder, WarehouseStore};
use crate::model::{new_id, MiniMap};

pub struct MiniMapWorker {
    store: Arc<dyn WarehouseStore>,
    builder: Arc<dyn MapBuilder>,
    settings: Settings,
}

impl MiniMapWorker {
    pub fn new(
        store: Arc<dyn WarehouseStore>,
        builder: Arc<dyn MapBuilder>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            builder,
            settings,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Knowledge-map worker started");
        while !shutdown.is_cancelled() {
            self.build_one().await;
            sleep_or_shutdown(self.settings.minimap_idle, &shutdown).await;
        }
        info!("Knowledge-map worker stopped");
    }

    /// Build at most one artifact: the oldest Completed warehouse lacking a
    /// map row.
    pub async fn build_one(&self) {
        let warehouse = match self.store.oldest_completed_without_map().await {
            Ok(Some(w)) => w,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Knowledge-map scan failed");
                return;
            }
        };
        let document = match self.store.get_document(warehouse.id.clone()).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!(warehouse_id = %warehouse.id, "Completed warehouse has no document row, skipping map");
                return;
            }
            Err(e) => {
                error!(warehouse_id = %warehouse.id, error = %e, "Failed to load document for map build");
                return;
            }
        };
        match self
            .builder
            .build_map(warehouse.clone(), document)
            .await
        {
            Ok(value) => {
                let map = MiniMap {
                    id: new_id(),
                    warehouse_id: warehouse.id.clone(),
                    value: value.to_string(),
                    created_at: Utc::now(),
                };
                match self.store.insert_mini_map(map).await {
                    Ok(()) => {
                        info!(warehouse_id = %warehouse.id, "Knowledge map built");
                    }
                    Err(e) => {
                        // Lost the at-most-once race or store trouble; the
                        // next scan will no longer select this warehouse.
                        warn!(warehouse_id = %warehouse.id, error = %e, "Knowledge map insert refused");
                    }
                }
            }
            Err(e) => {
                error!(warehouse_id = %warehouse.id, error = %e, "Knowledge map build failed, will retry next cycle");
            }
        }
    }
}
