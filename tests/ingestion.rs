use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use repo_wiki::config::Settings;
use repo_wiki::contract::{
    CloneOutcome, MockDocumentBuilder, MockGitClient, WarehouseStore,
};
use repo_wiki::coordinator::IngestionCoordinator;
use repo_wiki::model::{new_id, Warehouse, WarehouseStatus};
use repo_wiki::store::InMemoryStore;

fn fast_settings() -> Settings {
    Settings {
        poll_interval: Duration::from_millis(10),
        error_cooldown: Duration::from_millis(10),
        ..Settings::default()
    }
}

fn pending_warehouse() -> Warehouse {
    Warehouse {
        id: new_id(),
        address: "https://github.com/acme/widgets.git".into(),
        branch: "main".into(),
        version: String::new(),
        status: WarehouseStatus::Pending,
        organization: "acme".into(),
        name: "widgets".into(),
        credentials: None,
        error: String::new(),
        created_at: Utc::now(),
    }
}

/// Run the coordinator until the warehouse reaches a terminal status.
async fn run_until_terminal(
    coordinator: Arc<IngestionCoordinator>,
    store: Arc<InMemoryStore>,
    warehouse_id: String,
) -> Warehouse {
    let shutdown = CancellationToken::new();
    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.run(shutdown).await })
    };
    let final_state = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let w = store
                .get_warehouse(warehouse_id.clone())
                .await
                .unwrap()
                .unwrap();
            if matches!(w.status, WarehouseStatus::Completed | WarehouseStatus::Failed) {
                return w;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("warehouse should reach a terminal status");
    shutdown.cancel();
    let _ = worker.await;
    final_state
}

#[tokio::test]
async fn successful_ingestion_completes_with_cleared_error() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = pending_warehouse();
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let mut git = MockGitClient::new();
    git.expect_clone_repository().returning(|address, _, branch| {
        Ok(CloneOutcome {
            local_path: "/tmp/repos/widgets".into(),
            repo_name: "widgets".into(),
            organization: "acme".into(),
            branch,
            head_version: format!("head-of-{address}"),
        })
    });
    let mut builder = MockDocumentBuilder::new();
    builder.expect_build_initial().returning(|_, _| Ok(()));

    let coordinator = Arc::new(IngestionCoordinator::new(
        store.clone(),
        Arc::new(git),
        Arc::new(builder),
        fast_settings(),
    ));
    let final_state = run_until_terminal(coordinator, store.clone(), warehouse.id.clone()).await;

    assert_eq!(final_state.status, WarehouseStatus::Completed);
    assert!(final_state.error.is_empty());
    assert!(!final_state.version.is_empty(), "head version recorded");
    let document = store
        .get_document(warehouse.id)
        .await
        .unwrap()
        .expect("document row created on first clone");
    assert_eq!(document.git_path, "/tmp/repos/widgets");
}

#[tokio::test]
async fn clone_failure_marks_warehouse_failed_with_error_text() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = pending_warehouse();
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let mut git = MockGitClient::new();
    git.expect_clone_repository()
        .returning(|_, _, _| Err("authentication failed for remote".into()));
    let mut builder = MockDocumentBuilder::new();
    builder.expect_build_initial().never();

    let coordinator = Arc::new(IngestionCoordinator::new(
        store.clone(),
        Arc::new(git),
        Arc::new(builder),
        fast_settings(),
    ));
    let final_state = run_until_terminal(coordinator, store.clone(), warehouse.id.clone()).await;

    assert_eq!(final_state.status, WarehouseStatus::Failed);
    assert!(final_state.error.contains("authentication failed"));
    assert!(final_state.version.is_empty(), "version untouched on failure");
}

#[tokio::test]
async fn build_failure_marks_warehouse_failed() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = pending_warehouse();
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let mut git = MockGitClient::new();
    git.expect_clone_repository().returning(|_, _, branch| {
        Ok(CloneOutcome {
            local_path: "/tmp/repos/widgets".into(),
            repo_name: "widgets".into(),
            organization: "acme".into(),
            branch,
            head_version: "abc123".into(),
        })
    });
    let mut builder = MockDocumentBuilder::new();
    builder
        .expect_build_initial()
        .returning(|_, _| Err("catalogue generation exploded".into()));

    let coordinator = Arc::new(IngestionCoordinator::new(
        store.clone(),
        Arc::new(git),
        Arc::new(builder),
        fast_settings(),
    ));
    let final_state = run_until_terminal(coordinator, store.clone(), warehouse.id).await;

    assert_eq!(final_state.status, WarehouseStatus::Failed);
    assert!(final_state.error.contains("catalogue generation exploded"));
}

#[tokio::test]
async fn crashed_processing_row_is_reclaimed_before_pending() {
    let store = Arc::new(InMemoryStore::new());
    let mut stuck = pending_warehouse();
    stuck.status = WarehouseStatus::Processing;
    stuck.created_at = Utc::now();
    let newer = pending_warehouse();
    store.create_warehouse(newer).await.unwrap();
    store.create_warehouse(stuck.clone()).await.unwrap();

    let claimed = store.claim_next_warehouse().await.unwrap().unwrap();
    assert_eq!(claimed.id, stuck.id, "Processing row wins over Pending");
}
