//! In-memory [`WarehouseStore`] implementation.
//!
//! Backs the integration tests and the demo wiring of the binary. Uses `Vec`s
//! behind `std::sync::RwLock`; every conditional operation (claim, guarded
//! status update, at-most-once map insert) is performed under a single write
//! lock so it is atomic with respect to concurrent workers, matching the
//! semantics a SQL backend would provide with conditional updates.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::contract::{StoreError, WarehouseStore};
use crate::model::{
    Document, DocumentCatalog, DocumentCatalogI18n, DocumentCommitRecord, DocumentFileItem,
    DocumentFileItemI18n, MiniMap, TranslationKey, TranslationTask, TranslationTaskStatus,
    Warehouse, WarehouseStatus,
};

#[derive(Default)]
pub struct InMemoryStore {
    warehouses: RwLock<Vec<Warehouse>>,
    documents: RwLock<Vec<Document>>,
    catalogs: RwLock<Vec<DocumentCatalog>>,
    commit_records: RwLock<Vec<DocumentCommitRecord>>,
    tasks: RwLock<Vec<TranslationTask>>,
    file_items: RwLock<Vec<DocumentFileItem>>,
    catalog_i18n: RwLock<Vec<DocumentCatalogI18n>>,
    file_i18n: RwLock<Vec<DocumentFileItemI18n>>,
    mini_maps: RwLock<Vec<MiniMap>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All catalogue rows including soft-deleted ones; test helper for the
    /// audit-trail invariant.
    pub fn all_catalogs(&self) -> Vec<DocumentCatalog> {
        self.catalogs.read().unwrap().clone()
    }
}

#[async_trait]
impl WarehouseStore for InMemoryStore {
    async fn create_warehouse(&self, warehouse: Warehouse) -> Result<(), StoreError> {
        self.warehouses.write().unwrap().push(warehouse);
        Ok(())
    }

    async fn get_warehouse(&self, id: String) -> Result<Option<Warehouse>, StoreError> {
        Ok(self
            .warehouses
            .read()
            .unwrap()
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn claim_next_warehouse(&self) -> Result<Option<Warehouse>, StoreError> {
        let mut warehouses = self.warehouses.write().unwrap();
        // Processing rows first (crash recovery), then the oldest Pending.
        let candidate = warehouses
            .iter()
            .enumerate()
            .filter(|(_, w)| w.status == WarehouseStatus::Processing)
            .min_by_key(|(_, w)| w.created_at)
            .or_else(|| {
                warehouses
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.status == WarehouseStatus::Pending)
                    .min_by_key(|(_, w)| w.created_at)
            })
            .map(|(i, _)| i);
        match candidate {
            Some(i) => {
                warehouses[i].status = WarehouseStatus::Processing;
                Ok(Some(warehouses[i].clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_status_if(
        &self,
        id: String,
        expected: Vec<WarehouseStatus>,
        to: WarehouseStatus,
        error: String,
    ) -> Result<bool, StoreError> {
        let mut warehouses = self.warehouses.write().unwrap();
        match warehouses
            .iter_mut()
            .find(|w| w.id == id && expected.contains(&w.status))
        {
            Some(w) => {
                w.status = to;
                w.error = error;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_version(&self, id: String, version: String) -> Result<bool, StoreError> {
        let mut warehouses = self.warehouses.write().unwrap();
        match warehouses.iter_mut().find(|w| w.id == id) {
            Some(w) => {
                w.version = version;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_document(&self, document: Document) -> Result<(), StoreError> {
        let mut documents = self.documents.write().unwrap();
        match documents
            .iter_mut()
            .find(|d| d.warehouse_id == document.warehouse_id)
        {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
        Ok(())
    }

    async fn get_document(&self, warehouse_id: String) -> Result<Option<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap()
            .iter()
            .find(|d| d.warehouse_id == warehouse_id)
            .cloned())
    }

    async fn touch_document(
        &self,
        warehouse_id: String,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut documents = self.documents.write().unwrap();
        match documents.iter_mut().find(|d| d.warehouse_id == warehouse_id) {
            Some(d) => {
                d.last_update = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn next_stale_completed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<(Warehouse, Document)>, StoreError> {
        let warehouses = self.warehouses.read().unwrap();
        let documents = self.documents.read().unwrap();
        let mut stale: Vec<(Warehouse, Document)> = warehouses
            .iter()
            .filter(|w| w.status == WarehouseStatus::Completed)
            .filter_map(|w| {
                documents
                    .iter()
                    .find(|d| d.warehouse_id == w.id && d.last_update < cutoff)
                    .map(|d| (w.clone(), d.clone()))
            })
            .collect();
        stale.sort_by_key(|(_, d)| d.last_update);
        Ok(stale.into_iter().next())
    }

    async fn list_catalogs(
        &self,
        warehouse_id: String,
    ) -> Result<Vec<DocumentCatalog>, StoreError> {
        Ok(self
            .catalogs
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.warehouse_id == warehouse_id && !c.is_deleted)
            .cloned()
            .collect())
    }

    async fn insert_catalogs(&self, rows: Vec<DocumentCatalog>) -> Result<(), StoreError> {
        self.catalogs.write().unwrap().extend(rows);
        Ok(())
    }

    async fn soft_delete_catalogs(
        &self,
        ids: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut catalogs = self.catalogs.write().unwrap();
        let mut affected = 0;
        for catalog in catalogs
            .iter_mut()
            .filter(|c| !c.is_deleted && ids.contains(&c.id))
        {
            catalog.is_deleted = true;
            catalog.deleted_time = Some(at);
            affected += 1;
        }
        Ok(affected)
    }

    async fn latest_commit_record(
        &self,
        warehouse_id: String,
    ) -> Result<Option<DocumentCommitRecord>, StoreError> {
        Ok(self
            .commit_records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.warehouse_id == warehouse_id)
            .max_by_key(|r| r.last_update)
            .cloned())
    }

    async fn insert_commit_records(
        &self,
        rows: Vec<DocumentCommitRecord>,
    ) -> Result<(), StoreError> {
        self.commit_records.write().unwrap().extend(rows);
        Ok(())
    }

    async fn find_active_translation_task(
        &self,
        key: TranslationKey,
    ) -> Result<Option<TranslationTask>, StoreError> {
        Ok(self
            .tasks
            .read()
            .unwrap()
            .iter()
            .find(|t| {
                t.key() == key
                    && matches!(
                        t.status,
                        TranslationTaskStatus::Pending | TranslationTaskStatus::Running
                    )
            })
            .cloned())
    }

    async fn create_translation_task(&self, task: TranslationTask) -> Result<(), StoreError> {
        self.tasks.write().unwrap().push(task);
        Ok(())
    }

    async fn get_translation_task(
        &self,
        id: String,
    ) -> Result<Option<TranslationTask>, StoreError> {
        Ok(self
            .tasks
            .read()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn update_translation_task(&self, task: TranslationTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => {
                *existing = task;
                Ok(())
            }
            None => Err(format!("unknown translation task {}", task.id).into()),
        }
    }

    async fn list_running_translation_tasks(&self) -> Result<Vec<TranslationTask>, StoreError> {
        Ok(self
            .tasks
            .read()
            .unwrap()
            .iter()
            .filter(|t| t.status == TranslationTaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_file_items(
        &self,
        catalog_ids: Vec<String>,
    ) -> Result<Vec<DocumentFileItem>, StoreError> {
        Ok(self
            .file_items
            .read()
            .unwrap()
            .iter()
            .filter(|f| catalog_ids.contains(&f.catalog_id))
            .cloned()
            .collect())
    }

    async fn insert_file_items(&self, rows: Vec<DocumentFileItem>) -> Result<(), StoreError> {
        self.file_items.write().unwrap().extend(rows);
        Ok(())
    }

    async fn get_catalog_translation(
        &self,
        catalog_id: String,
        language: String,
    ) -> Result<Option<DocumentCatalogI18n>, StoreError> {
        Ok(self
            .catalog_i18n
            .read()
            .unwrap()
            .iter()
            .find(|r| r.catalog_id == catalog_id && r.language == language)
            .cloned())
    }

    async fn insert_catalog_translation(
        &self,
        row: DocumentCatalogI18n,
    ) -> Result<(), StoreError> {
        self.catalog_i18n.write().unwrap().push(row);
        Ok(())
    }

    async fn get_file_translation(
        &self,
        file_item_id: String,
        language: String,
    ) -> Result<Option<DocumentFileItemI18n>, StoreError> {
        Ok(self
            .file_i18n
            .read()
            .unwrap()
            .iter()
            .find(|r| r.file_item_id == file_item_id && r.language == language)
            .cloned())
    }

    async fn insert_file_translation(
        &self,
        row: DocumentFileItemI18n,
    ) -> Result<(), StoreError> {
        self.file_i18n.write().unwrap().push(row);
        Ok(())
    }

    async fn oldest_completed_without_map(&self) -> Result<Option<Warehouse>, StoreError> {
        let warehouses = self.warehouses.read().unwrap();
        let maps = self.mini_maps.read().unwrap();
        Ok(warehouses
            .iter()
            .filter(|w| w.status == WarehouseStatus::Completed)
            .filter(|w| !maps.iter().any(|m| m.warehouse_id == w.id))
            .min_by_key(|w| w.created_at)
            .cloned())
    }

    async fn insert_mini_map(&self, map: MiniMap) -> Result<(), StoreError> {
        let mut maps = self.mini_maps.write().unwrap();
        // At most one immutable map per warehouse.
        if maps.iter().any(|m| m.warehouse_id == map.warehouse_id) {
            return Err(format!("mini map already exists for warehouse {}", map.warehouse_id).into());
        }
        maps.push(map);
        Ok(())
    }

    async fn get_mini_map(&self, warehouse_id: String) -> Result<Option<MiniMap>, StoreError> {
        Ok(self
            .mini_maps
            .read()
            .unwrap()
            .iter()
            .find(|m| m.warehouse_id == warehouse_id)
            .cloned())
    }
}
