//! SQLite-backed `ReviewStore`.
//!
//! A single connection guarded by a mutex; every call runs on the blocking
//! pool so the async pipeline never stalls on disk I/O.

use super::schema;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use prreview_core::{
    check_transition, NewPullRequest, PrFile, PullRequest, ReviewRun, ReviewStore, RunStatus,
    Severity, StoreError, StoreResult, Suggestion,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

trait SqlResultExt<T> {
    fn db(self) -> StoreResult<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> StoreResult<T> {
        self.map_err(StoreError::backend)
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`, enabling WAL and foreign keys
    /// and applying schema migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )
        .db()?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory().db()?)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").db()?;
        conn.busy_timeout(Duration::from_secs(5)).db()?;
        schema::migrate(&mut conn).db()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> BoxFuture<'static, StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                f(&mut guard)
            })
            .await
            .map_err(StoreError::backend)?
        })
    }
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn col_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
struct UnknownEnumValue {
    kind: &'static str,
    value: String,
}

const RUN_COLUMNS: &str = "id, pr_id, status, provider, created_at, started_at, completed_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewRun> {
    let status: String = row.get(2)?;
    let status = RunStatus::parse(&status).ok_or_else(|| {
        conversion_err(
            2,
            UnknownEnumValue {
                kind: "run status",
                value: status.clone(),
            },
        )
    })?;
    Ok(ReviewRun {
        id: col_uuid(row, 0)?,
        target_id: col_uuid(row, 1)?,
        status,
        provider: row.get(3)?,
        created_at: col_time(row, 4)?,
        started_at: col_opt_time(row, 5)?,
        completed_at: col_opt_time(row, 6)?,
    })
}

fn suggestion_from_row(row: &Row<'_>) -> rusqlite::Result<Suggestion> {
    let severity: String = row.get(5)?;
    let severity = Severity::parse(&severity).ok_or_else(|| {
        conversion_err(
            5,
            UnknownEnumValue {
                kind: "severity",
                value: severity.clone(),
            },
        )
    })?;
    Ok(Suggestion {
        id: col_uuid(row, 0)?,
        run_id: col_uuid(row, 1)?,
        file_path: row.get(2)?,
        start_line: row.get(3)?,
        end_line: row.get(4)?,
        severity,
        message: row.get(6)?,
        fix_patch: row.get(7)?,
    })
}

fn find_run(db: &Connection, run_id: Uuid) -> StoreResult<Option<ReviewRun>> {
    db.query_row(
        &format!("SELECT {} FROM review_runs WHERE id = ?1", RUN_COLUMNS),
        params![run_id.to_string()],
        run_from_row,
    )
    .optional()
    .db()
}

fn require_run(db: &Connection, run_id: Uuid) -> StoreResult<ReviewRun> {
    find_run(db, run_id)?.ok_or(StoreError::NotFound {
        entity: "review run",
        id: run_id,
    })
}

fn find_pull_request(db: &Connection, target_id: Uuid) -> StoreResult<Option<PullRequest>> {
    let pr = db
        .query_row(
            "SELECT id, repo, number, title, author, head_sha, base_sha, state, created_at
             FROM pull_requests WHERE id = ?1",
            params![target_id.to_string()],
            |r| {
                Ok(PullRequest {
                    id: col_uuid(r, 0)?,
                    repo: r.get(1)?,
                    number: r.get(2)?,
                    title: r.get(3)?,
                    author: r.get(4)?,
                    head_sha: r.get(5)?,
                    base_sha: r.get(6)?,
                    state: r.get(7)?,
                    created_at: col_time(r, 8)?,
                    files: Vec::new(),
                })
            },
        )
        .optional()
        .db()?;

    let Some(mut pr) = pr else {
        return Ok(None);
    };

    let mut stmt = db
        .prepare("SELECT id, path, patch FROM pr_files WHERE pr_id = ?1 ORDER BY position")
        .db()?;
    pr.files = stmt
        .query_map(params![target_id.to_string()], |r| {
            Ok(PrFile {
                id: col_uuid(r, 0)?,
                path: r.get(1)?,
                patch: r.get(2)?,
            })
        })
        .db()?
        .collect::<rusqlite::Result<Vec<_>>>()
        .db()?;
    Ok(Some(pr))
}

fn upsert_pull_request(db: &mut Connection, pr: NewPullRequest) -> StoreResult<Uuid> {
    let tx = db
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .db()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM pull_requests WHERE repo = ?1 AND number = ?2",
            params![&pr.repo, pr.number],
            |r| r.get(0),
        )
        .optional()
        .db()?;

    let id = match existing {
        Some(raw) => {
            let id = Uuid::parse_str(&raw).map_err(StoreError::backend)?;
            tx.execute(
                "UPDATE pull_requests
                 SET title = ?1, author = ?2, head_sha = ?3, base_sha = ?4, state = 'open'
                 WHERE id = ?5",
                params![&pr.title, &pr.author, &pr.head_sha, &pr.base_sha, &raw],
            )
            .db()?;
            tx.execute("DELETE FROM pr_files WHERE pr_id = ?1", params![&raw])
                .db()?;
            id
        }
        None => {
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO pull_requests
                 (id, repo, number, title, author, head_sha, base_sha, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8)",
                params![
                    id.to_string(),
                    &pr.repo,
                    pr.number,
                    &pr.title,
                    &pr.author,
                    &pr.head_sha,
                    &pr.base_sha,
                    ts(&Utc::now()),
                ],
            )
            .db()?;
            id
        }
    };

    for (position, file) in pr.files.iter().enumerate() {
        tx.execute(
            "INSERT INTO pr_files (id, pr_id, position, path, patch) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                id.to_string(),
                position as i64,
                &file.path,
                &file.patch,
            ],
        )
        .db()?;
    }

    tx.commit().db()?;
    Ok(id)
}

impl ReviewStore for SqliteStore {
    fn create_pull_request(&self, pr: NewPullRequest) -> BoxFuture<'_, StoreResult<PullRequest>> {
        self.with_conn(move |db| {
            let id = upsert_pull_request(db, pr)?;
            find_pull_request(db, id)?.ok_or(StoreError::NotFound {
                entity: "pull request",
                id,
            })
        })
    }

    fn load_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Option<PullRequest>>> {
        self.with_conn(move |db| find_pull_request(db, target_id))
    }

    fn create_run(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_conn(move |db| {
            let exists: Option<i64> = db
                .query_row(
                    "SELECT 1 FROM pull_requests WHERE id = ?1",
                    params![target_id.to_string()],
                    |r| r.get(0),
                )
                .optional()
                .db()?;
            if exists.is_none() {
                return Err(StoreError::NotFound {
                    entity: "pull request",
                    id: target_id,
                });
            }
            let run = ReviewRun::queued(target_id);
            db.execute(
                "INSERT INTO review_runs (id, pr_id, status, provider, created_at)
                 VALUES (?1, ?2, ?3, NULL, ?4)",
                params![
                    run.id.to_string(),
                    target_id.to_string(),
                    run.status.as_str(),
                    ts(&run.created_at),
                ],
            )
            .db()?;
            Ok(run)
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Option<ReviewRun>>> {
        self.with_conn(move |db| find_run(db, run_id))
    }

    fn runs_for_target(&self, target_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReviewRun>>> {
        self.with_conn(move |db| {
            let mut stmt = db
                .prepare(&format!(
                    "SELECT {} FROM review_runs WHERE pr_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                    RUN_COLUMNS
                ))
                .db()?;
            let runs = stmt
                .query_map(params![target_id.to_string()], run_from_row)
                .db()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .db()?;
            Ok(runs)
        })
    }

    fn suggestions_for_run(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Suggestion>>> {
        self.with_conn(move |db| {
            let mut stmt = db
                .prepare(
                    "SELECT id, run_id, file_path, start_line, end_line, severity, message, fix_patch
                     FROM suggestions WHERE run_id = ?1 ORDER BY position",
                )
                .db()?;
            let rows = stmt
                .query_map(params![run_id.to_string()], suggestion_from_row)
                .db()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .db()?;
            Ok(rows)
        })
    }

    fn mark_running(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_conn(move |db| {
            let tx = db
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .db()?;
            let mut run = require_run(&tx, run_id)?;
            check_transition(&run, RunStatus::Running)?;
            tx.execute(
                "UPDATE review_runs SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![ts(&started_at), run_id.to_string()],
            )
            .db()?;
            tx.commit().db()?;
            run.status = RunStatus::Running;
            run.started_at = Some(started_at);
            Ok(run)
        })
    }

    fn complete_run(
        &self,
        run_id: Uuid,
        suggestions: Vec<Suggestion>,
        provider: String,
        completed_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_conn(move |db| {
            let tx = db
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .db()?;
            let mut run = require_run(&tx, run_id)?;
            check_transition(&run, RunStatus::Completed)?;
            {
                let mut insert = tx
                    .prepare(
                        "INSERT INTO suggestions
                         (id, run_id, position, file_path, start_line, end_line, severity, message, fix_patch)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .db()?;
                for (position, s) in suggestions.iter().enumerate() {
                    insert
                        .execute(params![
                            s.id.to_string(),
                            s.run_id.to_string(),
                            position as i64,
                            &s.file_path,
                            s.start_line,
                            s.end_line,
                            s.severity.as_str(),
                            &s.message,
                            &s.fix_patch,
                        ])
                        .db()?;
                }
            }
            tx.execute(
                "UPDATE review_runs SET status = 'completed', completed_at = ?1, provider = ?2
                 WHERE id = ?3",
                params![ts(&completed_at), &provider, run_id.to_string()],
            )
            .db()?;
            tx.commit().db()?;
            run.status = RunStatus::Completed;
            run.completed_at = Some(completed_at);
            run.provider = Some(provider);
            Ok(run)
        })
    }

    fn mark_failed(&self, run_id: Uuid) -> BoxFuture<'_, StoreResult<ReviewRun>> {
        self.with_conn(move |db| {
            let mut run = require_run(db, run_id)?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            db.execute(
                "UPDATE review_runs SET status = 'failed' WHERE id = ?1",
                params![run_id.to_string()],
            )
            .db()?;
            run.status = RunStatus::Failed;
            Ok(run)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prreview_core::NewPrFile;

    fn new_pr(number: i64, files: &[(&str, &str)]) -> NewPullRequest {
        NewPullRequest {
            repo: "acme/widgets".to_string(),
            number,
            title: "Add widget".to_string(),
            author: "dev".to_string(),
            head_sha: "abc".to_string(),
            base_sha: "def".to_string(),
            files: files
                .iter()
                .map(|(path, patch)| NewPrFile {
                    path: path.to_string(),
                    patch: patch.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_file_set_and_keeps_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store
            .create_pull_request(new_pr(7, &[("a.rs", "@@ a"), ("b.rs", "@@ b")]))
            .await
            .unwrap();
        let second = store
            .create_pull_request(new_pr(7, &[("c.rs", "@@ c")]))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        let paths: Vec<_> = second.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["c.rs"]);
    }

    #[tokio::test]
    async fn files_keep_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pr = store
            .create_pull_request(new_pr(1, &[("z.rs", "1"), ("a.rs", "2"), ("m.rs", "3")]))
            .await
            .unwrap();
        let loaded = store.load_target(pr.id).await.unwrap().unwrap();
        let paths: Vec<_> = loaded.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["z.rs", "a.rs", "m.rs"]);
    }

    #[tokio::test]
    async fn create_run_requires_existing_target() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.create_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn foreign_key_rejects_orphan_suggestions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pr = store.create_pull_request(new_pr(1, &[])).await.unwrap();
        let run = store.create_run(pr.id).await.unwrap();
        store.mark_running(run.id, Utc::now()).await.unwrap();

        let orphan = Suggestion {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            file_path: "a.rs".to_string(),
            start_line: 1,
            end_line: 1,
            severity: Severity::Info,
            message: "m".to_string(),
            fix_patch: None,
        };
        let result = store
            .complete_run(run.id, vec![orphan], "mock".to_string(), Utc::now())
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));

        // The failed batch rolled back together with the status update.
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(store.suggestions_for_run(run.id).await.unwrap().is_empty());
    }
}
