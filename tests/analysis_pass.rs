use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use repo_wiki::analysis::{AnalysisEngine, AnalysisError, PassOutcome};
use repo_wiki::config::Settings;
use repo_wiki::contract::{
    Commit, FileChange, FileChangeKind, LlmError, MockDocumentBuilder, MockGitClient,
    MockLlmClient, PullOutcome, WarehouseStore,
};
use repo_wiki::model::{new_id, Document, DocumentCatalog, Warehouse, WarehouseStatus};
use repo_wiki::store::InMemoryStore;

fn completed_warehouse(version: &str) -> Warehouse {
    Warehouse {
        id: "w1".into(),
        address: "https://github.com/acme/widgets.git".into(),
        branch: "main".into(),
        version: version.into(),
        status: WarehouseStatus::Completed,
        organization: "acme".into(),
        name: "widgets".into(),
        credentials: None,
        error: String::new(),
        created_at: Utc::now(),
    }
}

fn document() -> Document {
    Document {
        id: new_id(),
        warehouse_id: "w1".into(),
        git_path: "/tmp/repos/widgets".into(),
        last_update: Utc::now() - Duration::days(10),
    }
}

fn catalog_node(id: &str) -> DocumentCatalog {
    DocumentCatalog {
        id: id.into(),
        warehouse_id: "w1".into(),
        parent_id: None,
        name: id.into(),
        title: format!("Node {id}"),
        prompt: String::new(),
        order: 0,
        is_deleted: false,
        deleted_time: None,
    }
}

fn two_new_commits() -> PullOutcome {
    let now = Utc::now();
    PullOutcome {
        commits: vec![
            Commit {
                sha: "c1".into(),
                author: "Alice".into(),
                message: "refactor module a".into(),
                timestamp: now - Duration::minutes(30),
            },
            Commit {
                sha: "c2".into(),
                author: "Bob".into(),
                message: "refactor module b".into(),
                timestamp: now,
            },
        ],
        head_version: "def789".into(),
    }
}

fn git_with_commits(pull: PullOutcome) -> MockGitClient {
    let mut git = MockGitClient::new();
    git.expect_pull_repository()
        .returning(move |_, _, _, _| Ok(pull.clone()));
    git.expect_diff_files().returning(|_, _, to| {
        let path = if to == "c1" { "src/a.go" } else { "src/b.go" };
        Ok(vec![FileChange {
            path: path.into(),
            kind: FileChangeKind::Modified,
        }])
    });
    git
}

/// Plan answers for catalogue prompts, changelog answers for release-note
/// prompts.
fn scripted_llm(plan: &'static str, changelog: &'static str) -> MockLlmClient {
    let mut llm = MockLlmClient::new();
    llm.expect_stream_complete().returning(move |req| {
        let text = if req.prompt.contains("release notes") {
            changelog
        } else {
            plan
        };
        Ok(stream::iter(vec![Ok(text.to_string())]).boxed())
    });
    llm
}

const CHANGELOG_JSON: &str = "<changelog>[{\"date\":\"2026-08-29\",\"title\":\"Refactors\",\
    \"description\":\"Modules a and b were reworked.\"}]</changelog>";

#[tokio::test]
async fn delta_soft_deletes_inserts_and_bumps_version() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = completed_warehouse("abc123");
    store.create_warehouse(warehouse.clone()).await.unwrap();
    store.insert_catalogs(vec![catalog_node("n1")]).await.unwrap();

    let plan = "<document_structure>{\"delete_id\":[\"n1\"],\"items\":[\
        {\"title\":\"New Feature\",\"type\":\"add\",\"children\":[]}]}</document_structure>";
    let mut builder = MockDocumentBuilder::new();
    builder
        .expect_build_changes()
        .times(1)
        .returning(|_, _, changes| {
            assert_eq!(changes.len(), 1);
            Ok(())
        });

    let engine = AnalysisEngine::new(
        store.clone(),
        Arc::new(git_with_commits(two_new_commits())),
        Arc::new(scripted_llm(plan, CHANGELOG_JSON)),
        Arc::new(builder),
        Settings::default(),
    );
    let outcome = engine
        .run_pass(&warehouse, &document(), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        PassOutcome::Updated {
            head_version,
            drafted,
            deleted,
        } => {
            assert_eq!(head_version, "def789");
            assert_eq!(drafted, 1);
            assert_eq!(deleted, 1);
        }
        other => panic!("expected Updated, got {other:?}"),
    }

    // n1 flipped to deleted, never physically removed.
    let all = store.all_catalogs();
    let n1 = all.iter().find(|c| c.id == "n1").expect("n1 row kept");
    assert!(n1.is_deleted);
    // One fresh draft at order 0.
    let live = store.list_catalogs("w1".into()).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].title, "New Feature");
    assert_eq!(live[0].order, 0);
    // Changelog records appended.
    let record = store.latest_commit_record("w1".into()).await.unwrap();
    assert_eq!(record.unwrap().title, "Refactors");
}

#[tokio::test]
async fn no_new_commits_is_a_noop() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = completed_warehouse("abc123");
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let mut git = MockGitClient::new();
    git.expect_pull_repository().returning(|_, _, _, _| {
        Ok(PullOutcome {
            commits: vec![],
            head_version: "abc123".into(),
        })
    });
    let mut llm = MockLlmClient::new();
    llm.expect_stream_complete().never();

    let engine = AnalysisEngine::new(
        store.clone(),
        Arc::new(git),
        Arc::new(llm),
        Arc::new(MockDocumentBuilder::new()),
        Settings::default(),
    );
    let outcome = engine
        .run_pass(&warehouse, &document(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, PassOutcome::NoChanges));
}

#[tokio::test]
async fn empty_delta_drafts_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = completed_warehouse("abc123");
    store.create_warehouse(warehouse.clone()).await.unwrap();
    store.insert_catalogs(vec![catalog_node("n1")]).await.unwrap();

    let plan = "<document_structure>{\"delete_id\":[],\"items\":[]}</document_structure>";
    let mut builder = MockDocumentBuilder::new();
    builder.expect_build_changes().never();

    let engine = AnalysisEngine::new(
        store.clone(),
        Arc::new(git_with_commits(two_new_commits())),
        Arc::new(scripted_llm(plan, CHANGELOG_JSON)),
        Arc::new(builder),
        Settings::default(),
    );
    let outcome = engine
        .run_pass(&warehouse, &document(), &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        PassOutcome::Updated { drafted, deleted, .. } => {
            assert_eq!(drafted, 0);
            assert_eq!(deleted, 0);
        }
        other => panic!("expected Updated, got {other:?}"),
    }
    // The existing node is untouched.
    let live = store.list_catalogs("w1".into()).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "n1");
}

#[tokio::test(start_paused = true)]
async fn permanently_failing_llm_is_tried_exactly_three_times() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = completed_warehouse("abc123");
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let mut llm = MockLlmClient::new();
    let call_counter = calls.clone();
    llm.expect_stream_complete().returning(move |_| {
        call_counter.fetch_add(1, Ordering::SeqCst);
        Err::<_, LlmError>("model endpoint unavailable".into())
    });

    let engine = AnalysisEngine::new(
        store.clone(),
        Arc::new(git_with_commits(two_new_commits())),
        Arc::new(llm),
        Arc::new(MockDocumentBuilder::new()),
        Settings::default(),
    );
    let result = engine
        .run_pass(&warehouse, &document(), &CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(result, Err(AnalysisError::Plan(_))));
    // Durable state untouched: baseline version and catalogue unchanged.
    let stored = store.get_warehouse("w1".into()).await.unwrap().unwrap();
    assert_eq!(stored.version, "abc123");
    assert!(store.all_catalogs().is_empty());
}

#[tokio::test]
async fn prose_wrapped_delta_still_parses() {
    let store = Arc::new(InMemoryStore::new());
    let warehouse = completed_warehouse("abc123");
    store.create_warehouse(warehouse.clone()).await.unwrap();

    let plan = "Sure, here is the updated structure you asked for:\n\
        <document_structure>\n```json\n{\"delete_id\":[],\"items\":[\
        {\"title\":\"Overview\",\"type\":\"add\",\"children\":[]}]}\n```\n</document_structure>\n\
        I hope this helps!";
    let mut builder = MockDocumentBuilder::new();
    builder.expect_build_changes().returning(|_, _, _| Ok(()));

    let engine = AnalysisEngine::new(
        store.clone(),
        Arc::new(git_with_commits(two_new_commits())),
        Arc::new(scripted_llm(plan, CHANGELOG_JSON)),
        Arc::new(builder),
        Settings::default(),
    );
    let outcome = engine
        .run_pass(&warehouse, &document(), &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        PassOutcome::Updated { drafted, .. } => assert_eq!(drafted, 1),
        other => panic!("expected Updated, got {other:?}"),
    }
}
