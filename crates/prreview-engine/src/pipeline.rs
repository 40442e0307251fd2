//! Run orchestrator: drives one review job from `queued` to a terminal status.

use crate::chunk::chunk_patch;
use crate::llm::client::{ClientSettings, ResilientClient};
use crate::llm::parse::normalize_items;
use crate::llm::prompts::{hunk_label, review_prompt};
use crate::static_rules::analyze_patch;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::FutureExt;
use prreview_adapters::config::Config;
use prreview_adapters::queue::NonRetryable;
use prreview_core::{
    first_real_provider, InferenceBackend, PrFile, ProviderTag, ReviewJob, ReviewStore, RunStatus,
    Severity, SuggestionDraft, UNKNOWN_FILE,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const NO_ISSUES_MESSAGE: &str =
    "No clear issues found. Consider adding/expanding unit tests for this change.";
const AI_UNAVAILABLE_MESSAGE: &str =
    "Mock suggestion (AI unavailable): add a brief comment describing this change.";
const NO_FILES_MESSAGE: &str =
    "No files with diffs were analyzed. Provide a unified diff patch to get suggestions.";

/// Everything a worker needs, built once at startup and shared by reference.
pub struct PipelineContext {
    pub store: Arc<dyn ReviewStore>,
    pub client: ResilientClient,
    pub config: Config,
}

impl PipelineContext {
    pub fn new(
        config: Config,
        store: Arc<dyn ReviewStore>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let client = ResilientClient::new(backend, ClientSettings::from(&config.inference));
        Self {
            store,
            client,
            config,
        }
    }
}

/// Outcome of one processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub provider: ProviderTag,
    pub suggestions: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Process one job. Run-fatal errors mark the run `failed` and are
    /// returned so the transport can apply its retry policy.
    pub async fn process(&self, job: &ReviewJob) -> Result<RunSummary> {
        info!(
            run_id = %job.run_id,
            target_id = %job.target_id,
            model = job
                .model
                .as_deref()
                .unwrap_or(self.ctx.config.inference.default_model.as_str()),
            "Process start"
        );

        match self.run(job).await {
            Ok(summary) => {
                info!(
                    run_id = %job.run_id,
                    target_id = %job.target_id,
                    count = summary.suggestions,
                    provider = %summary.provider,
                    "Process done"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(run_id = %job.run_id, error = %format!("{:#}", err), "Process error");
                if let Err(mark_err) = self.ctx.store.mark_failed(job.run_id).await {
                    warn!(run_id = %job.run_id, error = %mark_err, "Could not mark run failed");
                }
                Err(err)
            }
        }
    }

    async fn run(&self, job: &ReviewJob) -> Result<RunSummary> {
        let store = &self.ctx.store;
        let run = store
            .get_run(job.run_id)
            .await?
            .ok_or_else(|| anyhow!("Review run {} not found", job.run_id))?;

        // Redelivery after a terminal outcome never reopens the run.
        match run.status {
            RunStatus::Completed => {
                info!(run_id = %run.id, "Run already completed, skipping");
                let count = store.suggestions_for_run(run.id).await?.len();
                return Ok(RunSummary {
                    run_id: run.id,
                    status: run.status,
                    provider: ProviderTag::parse(run.provider.as_deref().unwrap_or_default()),
                    suggestions: count,
                });
            }
            RunStatus::Failed => {
                let reason = format!("Review run {} already failed", run.id);
                return Err(NonRetryable::new(reason).into());
            }
            RunStatus::Queued | RunStatus::Running => {}
        }

        store
            .mark_running(job.run_id, Utc::now())
            .await
            .context("Failed to mark run running")?;

        let target = store
            .load_target(job.target_id)
            .await?
            .ok_or_else(|| anyhow!("PR not found: {}", job.target_id))?;

        let mut drafts: Vec<SuggestionDraft> = Vec::new();
        let mut providers_seen: Vec<ProviderTag> = Vec::new();

        for file in &target.files {
            if file.patch.trim().is_empty() {
                continue;
            }

            // Provider tags land in `providers_seen` hunk by hunk, so tags
            // observed before a panic are kept.
            let analysis = AssertUnwindSafe(self.analyze_file(
                file,
                job.model.as_deref(),
                &mut providers_seen,
            ))
            .catch_unwind()
            .await;
            match analysis {
                Ok(file_drafts) => drafts.extend(file_drafts),
                Err(panic) => {
                    warn!(
                        file = %file.path,
                        error = panic_message(panic.as_ref()),
                        "File analysis failed, degrading to mock suggestion"
                    );
                    drafts.push(SuggestionDraft::file_note(
                        &file.path,
                        Severity::Info,
                        AI_UNAVAILABLE_MESSAGE,
                    ));
                    providers_seen.push(ProviderTag::Mock);
                }
            }
        }

        if drafts.is_empty() {
            drafts.push(SuggestionDraft::file_note(
                UNKNOWN_FILE,
                Severity::Info,
                NO_FILES_MESSAGE,
            ));
            providers_seen.push(ProviderTag::Mock);
        }

        let provider = first_real_provider(&providers_seen);
        let limits = self.ctx.config.suggestions;
        let suggestions: Vec<_> = drafts
            .into_iter()
            .map(|d| d.clamped(&limits).into_suggestion(job.run_id))
            .collect();
        let count = suggestions.len();

        let done = store
            .complete_run(job.run_id, suggestions, provider.to_string(), Utc::now())
            .await
            .context("Failed to persist suggestions")?;

        Ok(RunSummary {
            run_id: done.id,
            status: done.status,
            provider,
            suggestions: count,
        })
    }

    /// Chunk, prompt and infer per hunk, then fall back to heuristics and
    /// finally to a generic note.
    async fn analyze_file(
        &self,
        file: &PrFile,
        model: Option<&str>,
        providers: &mut Vec<ProviderTag>,
    ) -> Vec<SuggestionDraft> {
        let limits = &self.ctx.config.suggestions;
        let chunked = chunk_patch(&file.patch, &self.ctx.config.patch);
        let total = chunked.hunks.len();

        let mut drafts = Vec::new();
        for (index, hunk) in chunked.hunks.iter().enumerate() {
            let prompt = review_prompt(&hunk_label(&file.path, index, total), hunk);
            let outcome = self.ctx.client.suggest(&prompt, model).await;
            drafts.extend(normalize_items(&outcome.items, &file.path, limits));
            providers.push(outcome.provider);
        }

        if drafts.is_empty() {
            drafts = analyze_patch(&file.path, &chunked.clamped);
        }
        if drafts.is_empty() {
            drafts.push(SuggestionDraft::file_note(
                &file.path,
                Severity::Info,
                NO_ISSUES_MESSAGE,
            ));
        }

        info!(file = %file.path, suggestions = drafts.len(), "Analyzed file");
        drafts
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use prreview_adapters::config::QueueConfig;
    use prreview_adapters::queue::{JobEvent, JobQueue};
    use prreview_adapters::store::MemoryStore;
    use prreview_core::{GenerateRequest, InferenceError, NewPrFile, NewPullRequest};
    use std::sync::Mutex;

    /// Answers every prompt with the same text; panics on prompts that
    /// contain `panic_on`.
    struct FixedBackend {
        text: String,
        panic_on: Option<&'static str>,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedBackend {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                panic_on: None,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn panicking_on(text: &str, marker: &'static str) -> Arc<Self> {
            Arc::new(Self {
                text: text.to_string(),
                panic_on: Some(marker),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl InferenceBackend for FixedBackend {
        fn name(&self) -> &str {
            "ollama"
        }

        fn generate<'a>(
            &'a self,
            request: &'a GenerateRequest,
        ) -> BoxFuture<'a, Result<String, InferenceError>> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if let Some(marker) = self.panic_on {
                if request.prompt.contains(marker) {
                    panic!("backend exploded");
                }
            }
            Box::pin(futures::future::ready(Ok(self.text.clone())))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.inference.default_model = "primary".to_string();
        config.inference.timeout_ms = 500;
        config.inference.retry_timeout_floor_ms = 100;
        config
    }

    fn file(path: &str, patch: &str) -> NewPrFile {
        NewPrFile {
            path: path.to_string(),
            patch: patch.to_string(),
        }
    }

    async fn setup(
        backend: Arc<dyn InferenceBackend>,
        files: Vec<NewPrFile>,
    ) -> (Arc<MemoryStore>, Orchestrator, ReviewJob) {
        let store = Arc::new(MemoryStore::new());
        let pr = store
            .create_pull_request(NewPullRequest {
                repo: "acme/web".to_string(),
                number: 1,
                title: "Change".to_string(),
                author: "dev".to_string(),
                head_sha: "h".to_string(),
                base_sha: "b".to_string(),
                files,
            })
            .await
            .unwrap();
        let run = store.create_run(pr.id).await.unwrap();
        let ctx = PipelineContext::new(test_config(), store.clone(), backend);
        let job = ReviewJob::new(run.id, pr.id, None);
        (store, Orchestrator::new(Arc::new(ctx)), job)
    }

    #[tokio::test]
    async fn eval_patch_with_empty_inference_yields_security_hint() {
        let (store, orchestrator, job) = setup(
            FixedBackend::new("[]"),
            vec![file("src/app.js", "@@ -1 +1 @@\n+const x = eval(input);")],
        )
        .await;

        let summary = orchestrator.process(&job).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.provider.is_mock());

        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert!(suggestions.iter().any(|s| s.severity == Severity::Security));
        let run = store.get_run(job.run_id).await.unwrap().unwrap();
        assert_eq!(run.provider.as_deref(), Some("mock"));
        assert!(run.started_at.is_some() && run.completed_at.is_some());
    }

    #[tokio::test]
    async fn empty_patch_files_are_skipped() {
        let reply = r#"[{"filePath":"unknown","startLine":4,"severity":"warn","message":"check null"}]"#;
        let (store, orchestrator, job) = setup(
            FixedBackend::new(reply),
            vec![
                file("src/lib.rs", "@@ -1 +1 @@\n+let a = b.unwrap();"),
                file("README.md", "  \n"),
            ],
        )
        .await;

        let summary = orchestrator.process(&job).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.provider, ProviderTag::model("ollama", "primary"));

        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].file_path, "src/lib.rs");
        assert_eq!((suggestions[0].start_line, suggestions[0].end_line), (4, 4));
        assert_eq!(suggestions[0].severity, Severity::Warn);
        let run = store.get_run(job.run_id).await.unwrap().unwrap();
        assert_eq!(run.provider.as_deref(), Some("ollama:primary"));
    }

    #[tokio::test]
    async fn clean_patch_gets_generic_note() {
        let (store, orchestrator, job) = setup(
            FixedBackend::new("not json"),
            vec![file("src/ok.rs", "@@ -1 +1 @@\n+let total = a + b;")],
        )
        .await;

        orchestrator.process(&job).await.unwrap();
        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].message, NO_ISSUES_MESSAGE);
        assert_eq!(suggestions[0].file_path, "src/ok.rs");
    }

    #[tokio::test]
    async fn run_without_patches_gets_unknown_file_note() {
        let (store, orchestrator, job) =
            setup(FixedBackend::new("[]"), vec![file("img.png", "")]).await;

        let summary = orchestrator.process(&job).await.unwrap();
        assert!(summary.provider.is_mock());
        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].file_path, UNKNOWN_FILE);
        assert_eq!(suggestions[0].message, NO_FILES_MESSAGE);
    }

    #[tokio::test]
    async fn missing_target_fails_run_and_returns_error() {
        let (store, orchestrator, job) =
            setup(FixedBackend::new("[]"), vec![file("a.rs", "@@\n+x")]).await;
        let orphan = ReviewJob::new(job.run_id, Uuid::new_v4(), None);

        let err = orchestrator.process(&orphan).await.unwrap_err();
        assert!(err.to_string().contains("PR not found"));
        let run = store.get_run(job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(store.suggestions_for_run(job.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_model_text_is_truncated_before_persisting() {
        let reply = serde_json::json!([{
            "message": "m".repeat(1500),
            "fixPatch": "p".repeat(6000),
        }])
        .to_string();
        let (store, orchestrator, job) = setup(
            FixedBackend::new(&reply),
            vec![file("a.rs", "@@ -1 +1 @@\n+x")],
        )
        .await;

        orchestrator.process(&job).await.unwrap();
        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions[0].message.chars().count(), 1000);
        assert_eq!(
            suggestions[0].fix_patch.as_ref().map(|p| p.chars().count()),
            Some(5000)
        );
    }

    #[tokio::test]
    async fn panicking_file_degrades_without_aborting_run() {
        let (store, orchestrator, job) = setup(
            FixedBackend::panicking_on("[]", "FILE: bad.js "),
            vec![
                file("bad.js", "@@ -1 +1 @@\n+x"),
                file("good.js", "@@ -1 +1 @@\n+el.innerHTML = html;"),
            ],
        )
        .await;

        let summary = orchestrator.process(&job).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.provider.is_mock());

        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions[0].file_path, "bad.js");
        assert_eq!(suggestions[0].message, AI_UNAVAILABLE_MESSAGE);
        assert_eq!(suggestions[1].file_path, "good.js");
        assert_eq!(suggestions[1].severity, Severity::Security);
    }

    #[tokio::test]
    async fn provider_seen_before_a_panic_is_kept() {
        let (store, orchestrator, job) = setup(
            FixedBackend::panicking_on(r#"[{"message":"m"}]"#, "(hunk 2/2)"),
            vec![file("src/lib.rs", "@@ -1 +1 @@\n+a\n@@ -9 +9 @@\n+b")],
        )
        .await;

        let summary = orchestrator.process(&job).await.unwrap();
        assert_eq!(summary.provider, ProviderTag::model("ollama", "primary"));

        // Drafts from the hunk that answered are dropped with the file.
        let suggestions = store.suggestions_for_run(job.run_id).await.unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].message, AI_UNAVAILABLE_MESSAGE);
        let run = store.get_run(job.run_id).await.unwrap().unwrap();
        assert_eq!(run.provider.as_deref(), Some("ollama:primary"));
    }

    #[tokio::test]
    async fn redelivered_completed_run_is_not_reprocessed() {
        let backend = FixedBackend::new("[]");
        let (store, orchestrator, job) =
            setup(backend.clone(), vec![file("a.js", "@@\n+eval(x)")]).await;

        orchestrator.process(&job).await.unwrap();
        let calls = backend.prompts.lock().unwrap().len();
        let again = orchestrator.process(&job).await.unwrap();

        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(backend.prompts.lock().unwrap().len(), calls);
        assert_eq!(
            store.suggestions_for_run(job.run_id).await.unwrap().len(),
            again.suggestions
        );
    }

    #[tokio::test]
    async fn transport_observes_run_failure() {
        let (store, orchestrator, job) =
            setup(FixedBackend::new("[]"), vec![file("a.rs", "@@\n+x")]).await;
        let orphan = ReviewJob::new(job.run_id, Uuid::new_v4(), None);

        let queue = JobQueue::new(QueueConfig {
            attempts: 3,
            backoff_ms: 1,
            retention_secs: 60,
        });
        let mut events = queue.subscribe();
        queue.enqueue(orphan);
        let stats = queue
            .run_until_idle(|job| {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.process(&job).await.map(|_| ()) }
            })
            .await;

        assert_eq!(stats.failed, 1);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        // The retry finds the run already failed and stops without a third
        // attempt, reporting the error that failed the run.
        match seen.last() {
            Some(JobEvent::Failed { attempts, error, .. }) => {
                assert_eq!(*attempts, 2);
                assert!(error.contains("PR not found"), "{error}");
            }
            other => panic!("unexpected last event: {:?}", other),
        }
        let run = store.get_run(job.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn redelivered_failed_run_is_not_retried() {
        let (store, orchestrator, job) =
            setup(FixedBackend::new("[]"), vec![file("a.rs", "@@\n+x")]).await;
        store.mark_failed(job.run_id).await.unwrap();

        let err = orchestrator.process(&job).await.unwrap_err();
        assert!(err.downcast_ref::<NonRetryable>().is_some());
        assert!(err.to_string().contains("already failed"));
    }
}
