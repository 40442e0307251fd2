//! In-process `ReviewStore` used by tests and dry runs.

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use prreview_core::{
    check_transition, NewPullRequest, PrFile, PullRequest, ReviewRun, ReviewStore, RunStatus,
    StoreError, StoreResult, Suggestion,
};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    pull_requests: HashMap<Uuid, PullRequest>,
    runs: Vec<ReviewRun>,
    suggestions: HashMap<Uuid, Vec<Suggestion>>,
}

impl MemoryState {
    fn run_mut(&mut self, run_id: Uuid) -> StoreResult<&mut ReviewRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::NotFound {
                entity: "review run",
                id: run_id,
            })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T, F>(&self, f: F) -> BoxFuture<'_, StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut MemoryState) -> StoreResult<T>,
    {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Box::pin(future::ready(f(&mut guard)))
    }
}

impl ReviewStore for MemoryStore {
    fn create_pull_request(&self, pr: NewPullRequest) -> BoxFuture<'_, StoreResult<PullRequest>> {
        self.with_state(move |state| {
            let files = pr
                .files
                .into_iter()
                .map(|f| PrFile {
                    id: Uuid::new_v4(),
                    path: f.path,
                    patch: f.patch,
                })
                .collect();

            let existing = state
                .pull_requests
                .values_mut()
                .find(|p| p.repo == pr.repo && p.number == pr.number);
            let stored = match existing {
                Some(current) => {
                    current.title = pr.title;
                    current.author = pr.author;
                    current.head_sha = pr.head_sha;
                    current.base_sha = pr.base_sha;
                    current.state = "open".to_string();
                    current.files = files;
                    current.clone()
                }
                None => {
                    let created = PullRequest {
                        id: Uuid::new_v4(),
                        repo: pr.repo,
                        number: pr.number,
                        title: pr.title,
                        author: pr.author,
                        head_sha: pr.head_sha,
                        base_sha: pr.base_sha,
                        state: "open".to_string(),
                        created_at: Utc::now(),
                        files,
                    };
                    state.pull_requests.insert(created.id, created.clone());
                    created
                }
            };
            Ok(stored)
        })
    }

    fn load_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Option<PullRequest>>> {
        self.with_state(move |state| Ok(state.pull_requests.get(&target_id).cloned()))
    }

    fn create_run(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_state(move |state| {
            if !state.pull_requests.contains_key(&target_id) {
                return Err(StoreError::NotFound {
                    entity: "pull request",
                    id: target_id,
                });
            }
            let run = ReviewRun::queued(target_id);
            state.runs.push(run.clone());
            Ok(run)
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Option<ReviewRun>>> {
        self.with_state(move |state| Ok(state.runs.iter().find(|r| r.id == run_id).cloned()))
    }

    fn runs_for_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReviewRun>>> {
        self.with_state(move |state| {
            // Insertion order breaks created_at ties, newest first.
            Ok(state
                .runs
                .iter()
                .rev()
                .filter(|r| r.target_id == target_id)
                .cloned()
                .collect())
        })
    }

    fn suggestions_for_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Suggestion>>> {
        self.with_state(move |state| {
            Ok(state.suggestions.get(&run_id).cloned().unwrap_or_default())
        })
    }

    fn mark_running(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_state(move |state| {
            let run = state.run_mut(run_id)?;
            check_transition(run, RunStatus::Running)?;
            run.status = RunStatus::Running;
            run.started_at = Some(started_at);
            Ok(run.clone())
        })
    }

    fn complete_run(
        &self,
        run_id: Uuid,
        suggestions: Vec<Suggestion>,
        provider: String,
        completed_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_state(move |state| {
            let run = state.run_mut(run_id)?;
            check_transition(run, RunStatus::Completed)?;
            run.status = RunStatus::Completed;
            run.completed_at = Some(completed_at);
            run.provider = Some(provider);
            let done = run.clone();
            state.suggestions.insert(run_id, suggestions);
            Ok(done)
        })
    }

    fn mark_failed(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_state(move |state| {
            let run = state.run_mut(run_id)?;
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
            }
            Ok(run.clone())
        })
    }
}
