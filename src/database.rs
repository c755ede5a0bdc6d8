use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::config::Limits;
use crate::create_timestamp;
use crate::judge::{JudgeOutcome, TestCase};

const DATABASE_NAME: &str = "judged.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "judged").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",  // Write-Ahead Logging for better concurrency
        "PRAGMA synchronous = NORMAL;", // Balance between safety and performance
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS problems (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            title            TEXT    NOT NULL DEFAULT '',
            time_limit_ms    INTEGER NOT NULL DEFAULT 5000,
            memory_limit_mb  INTEGER NOT NULL DEFAULT 256
        );",
        r"
        CREATE TABLE IF NOT EXISTS samples (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            problem_id    INTEGER NOT NULL,
            input         TEXT    NOT NULL,
            output        TEXT    NOT NULL,
            is_hidden     INTEGER NOT NULL DEFAULT 0,
            is_displayed  INTEGER NOT NULL DEFAULT 1,
            sort_order    INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (problem_id) REFERENCES problems (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_samples_problem_id ON samples(problem_id);",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            problem_id         INTEGER NOT NULL,
            task_id            INTEGER,
            user_id            INTEGER,
            code               TEXT    NOT NULL,
            language           TEXT    NOT NULL DEFAULT 'cpp',
            status             TEXT    NOT NULL DEFAULT 'queued',
            verdict            TEXT,
            total_tests        INTEGER NOT NULL DEFAULT 0,
            passed_tests       INTEGER NOT NULL DEFAULT 0,
            results            TEXT,
            error_message      TEXT,
            submit_time        TEXT    NOT NULL,
            judge_start_time   TEXT,
            judge_end_time     TEXT,
            judge_duration_ms  INTEGER,
            FOREIGN KEY (problem_id) REFERENCES problems (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);",
        "CREATE INDEX IF NOT EXISTS idx_submissions_problem_id ON submissions(problem_id);",
        r"
        CREATE TABLE IF NOT EXISTS judge_jobs (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id    INTEGER NOT NULL,
            time_limit_ms    INTEGER NOT NULL,
            memory_limit_mb  INTEGER NOT NULL,
            state            TEXT    NOT NULL DEFAULT 'waiting',
            attempts         INTEGER NOT NULL DEFAULT 0,
            summary          TEXT,
            error            TEXT,
            created_time     TEXT    NOT NULL,
            updated_time     TEXT    NOT NULL,
            FOREIGN KEY (submission_id) REFERENCES submissions (id)
        );",
        "CREATE INDEX IF NOT EXISTS idx_judge_jobs_state ON judge_jobs(state);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist, ignore errors
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Lifecycle of a submission record. `Completed` and `Error` are terminal;
/// `Error` means the judging machinery failed, not the submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Queued,
    Judging,
    Completed,
    Error,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Judging => "judging",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewSubmission {
    pub problem_id: i64,
    pub task_id: Option<i64>,
    pub user_id: Option<i64>,
    pub code: String,
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionRecord {
    pub id: i64,
    pub problem_id: i64,
    pub task_id: Option<i64>,
    pub user_id: Option<i64>,
    pub code: String,
    pub language: String,
    pub status: String,
    pub verdict: Option<String>,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub results: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub submit_time: String,
    pub judge_start_time: Option<String>,
    pub judge_end_time: Option<String>,
    pub judge_duration_ms: Option<i64>,
}

/// One test case row, read-only to the judging core.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: i64,
    pub problem_id: i64,
    pub input: String,
    pub output: String,
    pub is_hidden: bool,
    pub is_displayed: bool,
    pub sort_order: i64,
}

impl From<Sample> for TestCase {
    fn from(sample: Sample) -> Self {
        Self {
            input: sample.input,
            expected: sample.output,
            is_hidden: sample.is_hidden,
        }
    }
}

/// Queue job row as persisted in `judge_jobs`.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub submission_id: i64,
    pub limits: Limits,
    pub attempts: u32,
}

pub async fn create_submission(
    body: &NewSubmission,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<i64> {
    let now = create_timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO submissions (problem_id, task_id, user_id, code, language, status, submit_time)
        VALUES (?, ?, ?, ?, ?, 'queued', ?)
        "#,
    )
    .bind(body.problem_id)
    .bind(body.task_id)
    .bind(body.user_id)
    .bind(&body.code)
    .bind(&body.language)
    .bind(&now)
    .execute(pool.as_ref())
    .await?;

    Ok(result.last_insert_rowid())
}

fn submission_from_row(row: &SqliteRow) -> SubmissionRecord {
    let results: Option<String> = row.get("results");
    SubmissionRecord {
        id: row.get("id"),
        problem_id: row.get("problem_id"),
        task_id: row.get("task_id"),
        user_id: row.get("user_id"),
        code: row.get("code"),
        language: row.get("language"),
        status: row.get("status"),
        verdict: row.get("verdict"),
        total_tests: row.get::<i64, _>("total_tests") as u32,
        passed_tests: row.get::<i64, _>("passed_tests") as u32,
        results: results.and_then(|raw| serde_json::from_str(&raw).ok()),
        error_message: row.get("error_message"),
        submit_time: row.get("submit_time"),
        judge_start_time: row.get("judge_start_time"),
        judge_end_time: row.get("judge_end_time"),
        judge_duration_ms: row.get("judge_duration_ms"),
    }
}

pub async fn fetch_submission(
    id: i64,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Option<SubmissionRecord>> {
    let row = sqlx::query("SELECT * FROM submissions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.as_ref())
        .await?;

    Ok(row.map(|row| submission_from_row(&row)))
}

/// Execution limits configured on a problem, or `None` for an unknown id.
pub async fn fetch_problem_limits(
    problem_id: i64,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<Option<Limits>> {
    let row = sqlx::query("SELECT time_limit_ms, memory_limit_mb FROM problems WHERE id = ?")
        .bind(problem_id)
        .fetch_optional(pool.as_ref())
        .await?;

    Ok(row.map(|row| Limits {
        time_limit_ms: row.get::<i64, _>("time_limit_ms") as u64,
        memory_limit_mb: row.get::<i64, _>("memory_limit_mb") as u64,
    }))
}

pub async fn fetch_samples(problem_id: i64, pool: Arc<SqlitePool>) -> sqlx::Result<Vec<Sample>> {
    let rows = sqlx::query(
        r#"
        SELECT id, problem_id, input, output, is_hidden, is_displayed, sort_order
        FROM samples
        WHERE problem_id = ?
        ORDER BY sort_order, id
        "#,
    )
    .bind(problem_id)
    .fetch_all(pool.as_ref())
    .await?;

    let samples = rows
        .iter()
        .map(|row| Sample {
            id: row.get("id"),
            problem_id: row.get("problem_id"),
            input: row.get("input"),
            output: row.get("output"),
            is_hidden: row.get::<i64, _>("is_hidden") != 0,
            is_displayed: row.get::<i64, _>("is_displayed") != 0,
            sort_order: row.get("sort_order"),
        })
        .collect();

    Ok(samples)
}

pub async fn mark_judging(id: i64, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let now = create_timestamp();

    sqlx::query("UPDATE submissions SET status = 'judging', judge_start_time = ? WHERE id = ?")
        .bind(&now)
        .bind(id)
        .execute(pool.as_ref())
        .await?;

    Ok(())
}

/// Writes a judged outcome as the submission's final result.
pub async fn save_outcome(
    id: i64,
    pool: Arc<SqlitePool>,
    outcome: &JudgeOutcome,
    duration_ms: u64,
) -> sqlx::Result<()> {
    let now = create_timestamp();
    let results = serde_json::to_string(&outcome.results).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
        r#"
        UPDATE submissions
        SET status = 'completed',
            verdict = ?,
            total_tests = ?,
            passed_tests = ?,
            results = ?,
            error_message = NULL,
            judge_end_time = ?,
            judge_duration_ms = ?
        WHERE id = ?
        "#,
    )
    .bind(outcome.verdict.as_str())
    .bind(outcome.total_tests as i64)
    .bind(outcome.passed_tests as i64)
    .bind(&results)
    .bind(&now)
    .bind(duration_ms as i64)
    .bind(id)
    .execute(pool.as_ref())
    .await?;

    Ok(())
}

/// Leaves the submission in the `error` status after an infrastructure
/// fault; never fabricates a verdict.
pub async fn save_error(
    id: i64,
    pool: Arc<SqlitePool>,
    message: &str,
    duration_ms: u64,
) -> sqlx::Result<()> {
    let now = create_timestamp();

    sqlx::query(
        r#"
        UPDATE submissions
        SET status = 'error',
            error_message = ?,
            judge_end_time = ?,
            judge_duration_ms = ?
        WHERE id = ?
        "#,
    )
    .bind(message)
    .bind(&now)
    .bind(duration_ms as i64)
    .bind(id)
    .execute(pool.as_ref())
    .await?;

    Ok(())
}

pub async fn insert_job(
    submission_id: i64,
    limits: Limits,
    pool: Arc<SqlitePool>,
) -> sqlx::Result<i64> {
    let now = create_timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO judge_jobs (submission_id, time_limit_ms, memory_limit_mb, state, created_time, updated_time)
        VALUES (?, ?, ?, 'waiting', ?, ?)
        "#,
    )
    .bind(submission_id)
    .bind(limits.time_limit_ms as i64)
    .bind(limits.memory_limit_mb as i64)
    .bind(&now)
    .bind(&now)
    .execute(pool.as_ref())
    .await?;

    Ok(result.last_insert_rowid())
}

fn job_from_row(row: &SqliteRow) -> JobRow {
    JobRow {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        limits: Limits {
            time_limit_ms: row.get::<i64, _>("time_limit_ms") as u64,
            memory_limit_mb: row.get::<i64, _>("memory_limit_mb") as u64,
        },
        attempts: row.get::<i64, _>("attempts") as u32,
    }
}

/// Jobs to pick up again after a restart: everything still waiting, plus
/// jobs that were active when the previous process died (at-least-once).
pub async fn fetch_resumable_jobs(pool: Arc<SqlitePool>) -> sqlx::Result<Vec<JobRow>> {
    let rows = sqlx::query(
        r#"
        SELECT id, submission_id, time_limit_ms, memory_limit_mb, attempts
        FROM judge_jobs
        WHERE state IN ('waiting', 'active')
        ORDER BY id
        "#,
    )
    .fetch_all(pool.as_ref())
    .await?;

    Ok(rows.iter().map(job_from_row).collect())
}

pub async fn mark_job_active(job_id: i64, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    set_job_state(job_id, "active", pool).await
}

pub async fn mark_job_waiting(job_id: i64, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    set_job_state(job_id, "waiting", pool).await
}

async fn set_job_state(job_id: i64, state: &str, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let now = create_timestamp();

    sqlx::query("UPDATE judge_jobs SET state = ?, updated_time = ? WHERE id = ?")
        .bind(state)
        .bind(&now)
        .bind(job_id)
        .execute(pool.as_ref())
        .await?;

    Ok(())
}

/// Increments the job's failure count and returns the new total.
pub async fn record_job_attempt(job_id: i64, pool: Arc<SqlitePool>) -> sqlx::Result<u32> {
    let now = create_timestamp();

    let row = sqlx::query(
        "UPDATE judge_jobs SET attempts = attempts + 1, updated_time = ? WHERE id = ? RETURNING attempts",
    )
    .bind(&now)
    .bind(job_id)
    .fetch_one(pool.as_ref())
    .await?;

    Ok(row.get::<i64, _>("attempts") as u32)
}

pub async fn complete_job(job_id: i64, summary: &str, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let now = create_timestamp();

    sqlx::query(
        "UPDATE judge_jobs SET state = 'completed', summary = ?, updated_time = ? WHERE id = ?",
    )
    .bind(summary)
    .bind(&now)
    .bind(job_id)
    .execute(pool.as_ref())
    .await?;

    Ok(())
}

pub async fn fail_job(job_id: i64, error: &str, pool: Arc<SqlitePool>) -> sqlx::Result<()> {
    let now = create_timestamp();

    sqlx::query("UPDATE judge_jobs SET state = 'failed', error = ?, updated_time = ? WHERE id = ?")
        .bind(error)
        .bind(&now)
        .bind(job_id)
        .execute(pool.as_ref())
        .await?;

    Ok(())
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub waiting: u32,
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
}

pub async fn count_jobs(pool: Arc<SqlitePool>) -> sqlx::Result<QueueCounts> {
    let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM judge_jobs GROUP BY state")
        .fetch_all(pool.as_ref())
        .await?;

    let mut counts = QueueCounts::default();
    for row in rows {
        let n = row.get::<i64, _>("n") as u32;
        match row.get::<String, _>("state").as_str() {
            "waiting" => counts.waiting = n,
            "active" => counts.active = n,
            "completed" => counts.completed = n,
            "failed" => counts.failed = n,
            other => log::warn!("Unknown job state in database: {other}"),
        }
    }

    Ok(counts)
}

/// Deletes all but the newest `keep` jobs in the given terminal state.
pub async fn prune_jobs(state: &str, keep: u32, pool: Arc<SqlitePool>) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM judge_jobs
        WHERE state = ?
          AND id NOT IN (
            SELECT id FROM judge_jobs WHERE state = ? ORDER BY id DESC LIMIT ?
          )
        "#,
    )
    .bind(state)
    .bind(state)
    .bind(keep as i64)
    .execute(pool.as_ref())
    .await?;

    Ok(result.rows_affected())
}
