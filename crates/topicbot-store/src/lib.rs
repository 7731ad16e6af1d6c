//! topicbot-store: SQLite-backed persistence for scheduled jobs.
//!
//! One durable row per job, keyed by id, with a monotonically increasing
//! `version` column for optimistic concurrency control. Every mutation is
//! written through before the call returns, so a crash mid-dispatch can at
//! worst duplicate a send, never silently drop a pending job.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use topicbot_types::{Job, JobState, Payload, Schedule, Target, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("concurrent modification of job {0}")]
    Conflict(String),
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    chat_id INTEGER NOT NULL,
    topic_id INTEGER,
    payload TEXT NOT NULL,
    schedule TEXT NOT NULL,
    next_fire_at INTEGER,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_dispatched_at INTEGER,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, next_fire_at);";

/// SQLite-based storage for scheduled jobs.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the job database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Job store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a job by id. Rejects malformed input before
    /// touching the database.
    pub async fn put(&self, job: &Job) -> Result<()> {
        job.validate()?;

        let conn = self.conn.clone();
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            let payload =
                serde_json::to_string(&job.payload).map_err(|e| corrupt(&job.id, e.to_string()))?;
            let schedule = serde_json::to_string(&job.schedule)
                .map_err(|e| corrupt(&job.id, e.to_string()))?;

            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO jobs
                    (id, chat_id, topic_id, payload, schedule, next_fire_at, state,
                     retry_count, last_error, last_dispatched_at, created_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    chat_id = excluded.chat_id,
                    topic_id = excluded.topic_id,
                    payload = excluded.payload,
                    schedule = excluded.schedule,
                    next_fire_at = excluded.next_fire_at,
                    state = excluded.state,
                    retry_count = excluded.retry_count,
                    last_error = excluded.last_error,
                    last_dispatched_at = excluded.last_dispatched_at,
                    version = excluded.version",
                rusqlite::params![
                    job.id,
                    job.target.chat_id,
                    job.target.topic_id,
                    payload,
                    schedule,
                    job.next_fire_at.map(|t| t.timestamp_millis()),
                    job.state.as_str(),
                    job.retry_count,
                    job.last_error,
                    job.last_dispatched_at.map(|t| t.timestamp_millis()),
                    job.created_at.timestamp_millis(),
                    job.version,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Insert a brand-new job. Unlike [`JobStore::put`] this never
    /// overwrites: a row with the same id already present fails with
    /// [`StoreError::Conflict`], enforced by the primary key rather than a
    /// racy read-then-write.
    pub async fn insert(&self, job: &Job) -> Result<()> {
        job.validate()?;

        let conn = self.conn.clone();
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            let payload =
                serde_json::to_string(&job.payload).map_err(|e| corrupt(&job.id, e.to_string()))?;
            let schedule = serde_json::to_string(&job.schedule)
                .map_err(|e| corrupt(&job.id, e.to_string()))?;

            let conn = conn.blocking_lock();
            let res = conn.execute(
                "INSERT INTO jobs
                    (id, chat_id, topic_id, payload, schedule, next_fire_at, state,
                     retry_count, last_error, last_dispatched_at, created_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    job.id,
                    job.target.chat_id,
                    job.target.topic_id,
                    payload,
                    schedule,
                    job.next_fire_at.map(|t| t.timestamp_millis()),
                    job.state.as_str(),
                    job.retry_count,
                    job.last_error,
                    job.last_dispatched_at.map(|t| t.timestamp_millis()),
                    job.created_at.timestamp_millis(),
                    job.version,
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(job.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    /// Get a job by id.
    pub async fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let raw = query_raw(&conn, &id)?;
            match raw {
                Some(raw) => decode_job(raw),
                None => Err(StoreError::NotFound(id)),
            }
        })
        .await?
    }

    /// Delete a job. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await?
    }

    /// List jobs, optionally filtered by state, ordered by creation time.
    pub async fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let raws = match filter {
                Some(state) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC, id ASC",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![state.as_str()], raw_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?;
                    let rows = stmt
                        .query_map([], raw_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            raws.into_iter().map(decode_job).collect()
        })
        .await?
    }

    /// Active jobs with `next_fire_at <= now`, ordered by `next_fire_at`
    /// ascending then id ascending (deterministic tie-break).
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT * FROM jobs
                 WHERE state = 'active' AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at ASC, id ASC",
            )?;
            let raws = stmt
                .query_map(rusqlite::params![now.timestamp_millis()], raw_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            raws.into_iter().map(decode_job).collect()
        })
        .await?
    }

    /// Earliest `next_fire_at` across all Active jobs, for the loop's
    /// sleep arithmetic.
    pub async fn min_next_fire(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let min: Option<i64> = conn
                .query_row(
                    "SELECT MIN(next_fire_at) FROM jobs
                     WHERE state = 'active' AND next_fire_at IS NOT NULL",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(min.and_then(DateTime::from_timestamp_millis))
        })
        .await?
    }

    /// Atomic compare-and-set mutation of a job record.
    ///
    /// Re-reads the row, fails with [`StoreError::Conflict`] if the stored
    /// version no longer matches `expected_version` (concurrent modification
    /// or deletion), otherwise applies `mutate`, bumps the version, and
    /// writes the row back. Returns the updated job.
    pub async fn update<F>(&self, id: &str, expected_version: i64, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) + Send + 'static,
    {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let raw = query_raw(&conn, &id)?;
            let mut job = match raw {
                Some(raw) => decode_job(raw)?,
                None => return Err(StoreError::NotFound(id)),
            };
            if job.version != expected_version {
                return Err(StoreError::Conflict(id));
            }

            mutate(&mut job);
            job.version = expected_version + 1;

            let affected = conn.execute(
                "UPDATE jobs SET
                    payload = ?2, schedule = ?3, next_fire_at = ?4, state = ?5,
                    retry_count = ?6, last_error = ?7, last_dispatched_at = ?8, version = ?9
                 WHERE id = ?1 AND version = ?10",
                rusqlite::params![
                    job.id,
                    serde_json::to_string(&job.payload)
                        .map_err(|e| corrupt(&job.id, e.to_string()))?,
                    serde_json::to_string(&job.schedule)
                        .map_err(|e| corrupt(&job.id, e.to_string()))?,
                    job.next_fire_at.map(|t| t.timestamp_millis()),
                    job.state.as_str(),
                    job.retry_count,
                    job.last_error,
                    job.last_dispatched_at.map(|t| t.timestamp_millis()),
                    job.version,
                    expected_version,
                ],
            )?;
            if affected == 0 {
                return Err(StoreError::Conflict(job.id));
            }
            Ok(job)
        })
        .await?
    }
}

fn corrupt(id: &str, reason: String) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason,
    }
}

/// Row image before JSON/timestamp decoding.
struct RawJob {
    id: String,
    chat_id: i64,
    topic_id: Option<i64>,
    payload: String,
    schedule: String,
    next_fire_at: Option<i64>,
    state: String,
    retry_count: u32,
    last_error: Option<String>,
    last_dispatched_at: Option<i64>,
    created_at: i64,
    version: i64,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        topic_id: row.get("topic_id")?,
        payload: row.get("payload")?,
        schedule: row.get("schedule")?,
        next_fire_at: row.get("next_fire_at")?,
        state: row.get("state")?,
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
        last_dispatched_at: row.get("last_dispatched_at")?,
        created_at: row.get("created_at")?,
        version: row.get("version")?,
    })
}

fn query_raw(conn: &Connection, id: &str) -> Result<Option<RawJob>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
    Ok(stmt
        .query_row(rusqlite::params![id], raw_from_row)
        .optional()?)
}

fn decode_job(raw: RawJob) -> Result<Job> {
    let payload: Payload =
        serde_json::from_str(&raw.payload).map_err(|e| corrupt(&raw.id, e.to_string()))?;
    let schedule: Schedule =
        serde_json::from_str(&raw.schedule).map_err(|e| corrupt(&raw.id, e.to_string()))?;
    let state = JobState::from_str(&raw.state).map_err(|e| corrupt(&raw.id, e))?;
    let id = raw.id;
    let decode_ts = |ms: i64| {
        DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(&id, format!("bad timestamp {ms}")))
    };
    let next_fire_at = raw.next_fire_at.map(&decode_ts).transpose()?;
    let last_dispatched_at = raw.last_dispatched_at.map(&decode_ts).transpose()?;
    let created_at = decode_ts(raw.created_at)?;

    Ok(Job {
        id,
        target: Target {
            chat_id: raw.chat_id,
            topic_id: raw.topic_id,
        },
        payload,
        schedule,
        next_fire_at,
        state,
        retry_count: raw.retry_count,
        last_error: raw.last_error,
        last_dispatched_at,
        created_at,
        version: raw.version,
    })
}
