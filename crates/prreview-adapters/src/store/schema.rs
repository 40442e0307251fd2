use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;

/// Version tracking table, applied before anything else on every open.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    );
";

/// Full v1 schema.
pub const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS pull_requests (
        id          TEXT PRIMARY KEY,
        repo        TEXT NOT NULL,
        number      INTEGER NOT NULL,
        title       TEXT NOT NULL,
        author      TEXT NOT NULL,
        head_sha    TEXT NOT NULL,
        base_sha    TEXT NOT NULL,
        state       TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        UNIQUE (repo, number)
    );

    CREATE TABLE IF NOT EXISTS pr_files (
        id        TEXT PRIMARY KEY,
        pr_id     TEXT NOT NULL REFERENCES pull_requests(id) ON DELETE CASCADE,
        position  INTEGER NOT NULL,
        path      TEXT NOT NULL,
        patch     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pr_files_pr ON pr_files(pr_id, position);

    CREATE TABLE IF NOT EXISTS review_runs (
        id            TEXT PRIMARY KEY,
        pr_id         TEXT NOT NULL REFERENCES pull_requests(id) ON DELETE CASCADE,
        status        TEXT NOT NULL
                      CHECK (status IN ('queued', 'running', 'completed', 'failed')),
        provider      TEXT,
        created_at    TEXT NOT NULL,
        started_at    TEXT,
        completed_at  TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_review_runs_pr ON review_runs(pr_id, created_at);

    CREATE TABLE IF NOT EXISTS suggestions (
        id          TEXT PRIMARY KEY,
        run_id      TEXT NOT NULL REFERENCES review_runs(id) ON DELETE CASCADE,
        position    INTEGER NOT NULL,
        file_path   TEXT NOT NULL,
        start_line  INTEGER NOT NULL CHECK (start_line >= 1),
        end_line    INTEGER NOT NULL CHECK (end_line >= start_line),
        severity    TEXT NOT NULL
                    CHECK (severity IN ('info', 'warn', 'error', 'security')),
        message     TEXT NOT NULL,
        fix_patch   TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_suggestions_run ON suggestions(run_id, position);
";

/// Bring the database up to `SCHEMA_VERSION`.
pub fn migrate(db: &mut Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;
    let current: Option<i64> = db
        .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
        .optional()?
        .flatten();

    if current.unwrap_or(0) < 1 {
        let tx = db.transaction()?;
        tx.execute_batch(SCHEMA_V1)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
        tx.commit()?;
    }
    Ok(())
}
