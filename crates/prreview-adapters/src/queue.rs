//! In-process job transport.
//!
//! At-least-once delivery to a single worker, dedup on the job's idempotency
//! key, bounded retries with exponential backoff, and short retention of
//! finished records so late duplicates are still rejected.
//!
//! A handler error that downcasts to [`NonRetryable`] ends the job at once.
//! The failure event then reports the first error the job hit.

use crate::config::QueueConfig;
use prreview_core::{JobError, ReviewJob};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Handler error that retrying cannot fix.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct NonRetryable {
    reason: String,
}

impl NonRetryable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// A job with the same idempotency key is pending, active or retained.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        run_id: Uuid,
        attempt: u32,
    },
    Completed {
        run_id: Uuid,
    },
    Retrying {
        run_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        run_id: Uuid,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub completed: usize,
    pub failed: usize,
}

impl DrainStats {
    fn record(&mut self, outcome: Option<JobStatus>) {
        match outcome {
            Some(JobStatus::Completed) => self.completed += 1,
            Some(JobStatus::Failed) => self.failed += 1,
            _ => {}
        }
    }
}

struct PendingJob {
    job: ReviewJob,
    attempt: u32,
    ready_at: Instant,
}

struct JobRecord {
    status: JobStatus,
    finished_at: Option<Instant>,
    first_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingJob>,
    records: HashMap<String, JobRecord>,
    closed: bool,
}

enum Next {
    Ready(PendingJob),
    WaitUntil(Instant),
    Empty,
}

pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn enqueue(&self, job: ReviewJob) -> Enqueued {
        let key = job.idempotency_key();
        {
            let mut state = self.lock();
            self.prune(&mut state, Instant::now());
            if state.records.contains_key(&key) {
                debug!(run_id = %job.run_id, "Duplicate job ignored");
                return Enqueued::Duplicate;
            }
            state.records.insert(
                key,
                JobRecord {
                    status: JobStatus::Waiting,
                    finished_at: None,
                    first_error: None,
                },
            );
            state.pending.push_back(PendingJob {
                job,
                attempt: 1,
                ready_at: Instant::now(),
            });
        }
        self.notify.notify_one();
        Enqueued::Accepted
    }

    /// Validate a raw JSON payload before it can reach the pipeline.
    pub fn enqueue_payload(&self, payload: &str) -> Result<Enqueued, JobError> {
        match ReviewJob::from_payload(payload) {
            Ok(job) => Ok(self.enqueue(job)),
            Err(err) => {
                warn!(error = %err, "Rejected malformed job payload");
                Err(err)
            }
        }
    }

    pub fn status(&self, run_id: Uuid) -> Option<JobStatus> {
        let mut state = self.lock();
        self.prune(&mut state, Instant::now());
        state.records.get(&run_id.to_string()).map(|r| r.status)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Mark the queue closed; `run_worker` returns once nothing is pending.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Process jobs until nothing is pending, waiting out retry backoff.
    pub async fn run_until_idle<H, Fut>(&self, handler: H) -> DrainStats
    where
        H: Fn(ReviewJob) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut stats = DrainStats::default();
        loop {
            match self.next_job() {
                Next::Ready(pending) => stats.record(self.process(pending, &handler).await),
                Next::WaitUntil(at) => tokio::time::sleep_until(at).await,
                Next::Empty => return stats,
            }
        }
    }

    /// Worker loop with concurrency 1. Returns after `close` once nothing is
    /// pending.
    pub async fn run_worker<H, Fut>(&self, handler: H) -> DrainStats
    where
        H: Fn(ReviewJob) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut stats = DrainStats::default();
        loop {
            match self.next_job() {
                Next::Ready(pending) => stats.record(self.process(pending, &handler).await),
                Next::WaitUntil(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                Next::Empty if self.lock().closed => return stats,
                Next::Empty => self.notify.notified().await,
            }
        }
    }

    /// Runs one attempt; returns the terminal status if the job finished.
    async fn process<H, Fut>(&self, pending: PendingJob, handler: &H) -> Option<JobStatus>
    where
        H: Fn(ReviewJob) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let PendingJob { job, attempt, .. } = pending;
        let run_id = job.run_id;
        self.emit(JobEvent::Started { run_id, attempt });

        let result = handler(job.clone()).await;
        let key = job.idempotency_key();
        let mut state = self.lock();
        let now = Instant::now();

        let first_error = state.records.get(&key).and_then(|r| r.first_error.clone());

        let err = match result {
            Ok(()) => {
                state.records.insert(
                    key,
                    JobRecord {
                        status: JobStatus::Completed,
                        finished_at: Some(now),
                        first_error,
                    },
                );
                drop(state);
                self.emit(JobEvent::Completed { run_id });
                return Some(JobStatus::Completed);
            }
            Err(err) => err,
        };
        let retryable = err.downcast_ref::<NonRetryable>().is_none();
        let error = format!("{:#}", err);

        if retryable && attempt < self.config.attempts {
            let delay = self.backoff(attempt);
            warn!(
                run_id = %run_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retrying"
            );
            state.records.insert(
                key,
                JobRecord {
                    status: JobStatus::Waiting,
                    finished_at: None,
                    first_error: first_error.or_else(|| Some(error.clone())),
                },
            );
            state.pending.push_back(PendingJob {
                job,
                attempt: attempt + 1,
                ready_at: now + delay,
            });
            drop(state);
            self.emit(JobEvent::Retrying {
                run_id,
                attempt,
                delay,
                error,
            });
            return None;
        }

        // A non-retryable follow-up reports what originally broke the job.
        let reported = match (retryable, first_error) {
            (false, Some(first)) => first,
            _ => error.clone(),
        };
        warn!(
            run_id = %run_id,
            attempts = attempt,
            error = %error,
            reported = %reported,
            "Job failed permanently"
        );
        state.records.insert(
            key,
            JobRecord {
                status: JobStatus::Failed,
                finished_at: Some(now),
                first_error: Some(reported.clone()),
            },
        );
        drop(state);
        self.emit(JobEvent::Failed {
            run_id,
            attempts: attempt,
            error: reported,
        });
        Some(JobStatus::Failed)
    }

    fn next_job(&self) -> Next {
        let mut state = self.lock();
        let now = Instant::now();
        self.prune(&mut state, now);

        if let Some(idx) = state.pending.iter().position(|p| p.ready_at <= now) {
            if let Some(pending) = state.pending.remove(idx) {
                if let Some(record) = state.records.get_mut(&pending.job.idempotency_key()) {
                    record.status = JobStatus::Active;
                }
                return Next::Ready(pending);
            }
        }
        match state.pending.iter().map(|p| p.ready_at).min() {
            Some(at) => Next::WaitUntil(at),
            None => Next::Empty,
        }
    }

    /// `base * 2^(attempt - 1)`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.config.backoff_ms.saturating_mul(factor))
    }

    fn prune(&self, state: &mut QueueState, now: Instant) {
        let retention = Duration::from_secs(self.config.retention_secs);
        state.records.retain(|_, record| match record.finished_at {
            Some(done) => now.duration_since(done) < retention,
            None => true,
        });
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
