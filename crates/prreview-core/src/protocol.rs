//! Persistence contract between the pipeline and the record store.

use crate::model::{NewPullRequest, PullRequest, ReviewRun, RunStatus, Suggestion};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Record store for pull requests, runs and suggestions.
///
/// The orchestrator is the only writer of run status and suggestions.
pub trait ReviewStore: Send + Sync {
    /// Upsert by `(repo, number)`; an update replaces the whole file set.
    fn create_pull_request(&self, pr: NewPullRequest) -> BoxFuture<'_, StoreResult<PullRequest>>;

    /// Load a pull request with its files in stored order.
    fn load_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Option<PullRequest>>>;

    /// Create a run in status `queued` for an existing pull request.
    fn create_run(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>>;

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Option<ReviewRun>>>;

    /// Runs for a pull request, newest first.
    fn runs_for_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReviewRun>>>;

    /// Suggestions for a run in insertion order.
    fn suggestions_for_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Suggestion>>>;

    /// `queued | running -> running`, stamping `started_at`.
    fn mark_running(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>>;

    /// Insert the suggestion batch and set `completed` atomically.
    fn complete_run(
        &self,
        run_id: Uuid,
        suggestions: Vec<Suggestion>,
        provider: String,
        completed_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>>;

    /// Set `failed`; a run that is already terminal is left untouched.
    fn mark_failed(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>>;
}

/// Validate a status transition shared by every store implementation.
pub fn check_transition(run: &ReviewRun, to: RunStatus) -> StoreResult<()> {
    if !run.status.is_terminal() && to != RunStatus::Queued {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            run_id: run.id,
            from: run.status,
            to,
        })
    }
}
