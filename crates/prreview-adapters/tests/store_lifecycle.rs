use chrono::Utc;
use prreview_adapters::store::{MemoryStore, SqliteStore};
use prreview_core::{
    NewPrFile, NewPullRequest, ReviewStore, RunStatus, Severity, StoreError, SuggestionDraft,
};
use tempfile::TempDir;

fn sample_pr() -> NewPullRequest {
    NewPullRequest {
        repo: "acme/widgets".to_string(),
        number: 42,
        title: "Tighten parser".to_string(),
        author: "octo".to_string(),
        head_sha: "head".to_string(),
        base_sha: "base".to_string(),
        files: vec![
            NewPrFile {
                path: "src/lib.rs".to_string(),
                patch: "@@ -1 +1 @@\n-a\n+b".to_string(),
            },
            NewPrFile {
                path: "README.md".to_string(),
                patch: String::new(),
            },
        ],
    }
}

async fn exercise_lifecycle(store: &dyn ReviewStore) {
    let pr = store.create_pull_request(sample_pr()).await.unwrap();
    assert_eq!(pr.files.len(), 2);

    let run = store.create_run(pr.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.provider.is_none());

    let started = store.mark_running(run.id, Utc::now()).await.unwrap();
    assert_eq!(started.status, RunStatus::Running);
    assert!(started.started_at.is_some());

    let batch = vec![
        SuggestionDraft::file_note("src/lib.rs", Severity::Warn, "first").into_suggestion(run.id),
        SuggestionDraft::file_note("src/lib.rs", Severity::Security, "second")
            .into_suggestion(run.id),
    ];
    let done = store
        .complete_run(run.id, batch, "ollama:qwen2.5-coder:7b".to_string(), Utc::now())
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.provider.as_deref(), Some("ollama:qwen2.5-coder:7b"));

    let stored = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.completed_at.is_some());

    let suggestions = store.suggestions_for_run(run.id).await.unwrap();
    let messages: Vec<_> = suggestions.iter().map(|s| s.message.as_str()).collect();
    assert_eq!(messages, vec!["first", "second"]);
    assert_eq!(suggestions[1].severity, Severity::Security);

    // Terminal runs never move again; mark_failed is a no-op.
    let err = store.mark_running(run.id, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    let still = store.mark_failed(run.id).await.unwrap();
    assert_eq!(still.status, RunStatus::Completed);

    let second = store.create_run(pr.id).await.unwrap();
    let failed = store.mark_failed(second.id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);

    let runs = store.runs_for_target(pr.id).await.unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id, run.id]);
}

#[tokio::test]
async fn sqlite_store_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("prreview.db")).unwrap();
    exercise_lifecycle(&store).await;
}

#[tokio::test]
async fn memory_store_lifecycle() {
    let store = MemoryStore::new();
    exercise_lifecycle(&store).await;
}

#[tokio::test]
async fn sqlite_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prreview.db");

    let pr_id = {
        let store = SqliteStore::open(&path).unwrap();
        let pr = store.create_pull_request(sample_pr()).await.unwrap();
        store.create_run(pr.id).await.unwrap();
        pr.id
    };

    let store = SqliteStore::open(&path).unwrap();
    let pr = store.load_target(pr_id).await.unwrap().unwrap();
    assert_eq!(pr.number, 42);
    assert_eq!(pr.files[0].path, "src/lib.rs");
    assert_eq!(store.runs_for_target(pr_id).await.unwrap().len(), 1);
}
