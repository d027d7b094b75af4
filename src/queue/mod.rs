//! Durable retry queue for settlement side effects.
//!
//! Jobs live in the same SQLite database as the money they affect. Delivery
//! is at-least-once: a worker claims the next due row, runs the handler, and
//! either completes the job or re-queues it with exponential backoff. After
//! `max_attempts` failures the job parks in `failed` with its last error
//! kept for the operator; it is never silently dropped. Every handler is
//! idempotent, so a replayed job is harmless.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::models::MarketType;
use crate::odds::SelectionOutcome;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Work the queue knows how to carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Re-run the settlement check for one bet group, outside the periodic
    /// scanner cadence.
    ScanMatch {
        match_id: String,
        market_type: MarketType,
    },
    /// Apply settled results to every matched bet of the group.
    DeclareResult {
        match_id: String,
        market_type: MarketType,
        winners: HashMap<String, SelectionOutcome>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ScanMatch { .. } => "scan_match",
            JobPayload::DeclareResult { .. } => "declare_result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        JobStatus::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unrecognized value: {text}").into()))
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Row counts per status, exposed on the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    conn: DbHandle,
    max_attempts: u32,
    base_delay_secs: u64,
}

impl JobQueue {
    pub async fn new(
        conn: DbHandle,
        max_attempts: u32,
        base_delay_secs: u64,
    ) -> Result<Self, QueueError> {
        {
            let c = conn.lock().await;
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    run_at INTEGER NOT NULL,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);",
            )?;
            // Rows still `running` were claimed by a process that died before
            // completing them. Handlers are idempotent, so re-queueing them
            // immediately is safe and keeps delivery at-least-once.
            let now = Utc::now().timestamp();
            let reclaimed = c.execute(
                "UPDATE jobs SET status = 'queued', run_at = ?1, updated_at = ?1
                 WHERE status = 'running'",
                params![now],
            )?;
            if reclaimed > 0 {
                warn!(reclaimed, "re-queued jobs left running by a previous process");
            }
        }
        Ok(Self {
            conn,
            max_attempts: max_attempts.max(1),
            base_delay_secs,
        })
    }

    pub async fn enqueue(&self, payload: &JobPayload, run_at: i64) -> Result<Job, QueueError> {
        let encoded = serde_json::to_string(payload)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO jobs
                    (id, kind, payload, status, attempts, max_attempts, run_at,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?6)",
                params![id, payload.kind(), encoded, self.max_attempts, run_at, now],
            )?;
        }
        debug!(job_id = %id, kind = payload.kind(), run_at, "job enqueued");
        Ok(Job {
            id,
            payload: payload.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.max_attempts,
            run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Claim the next due job, flipping it to `running`. A job whose payload
    /// no longer parses is parked as failed so it cannot wedge the queue.
    pub async fn claim_due(&self, now: i64) -> Result<Option<Job>, QueueError> {
        let claimed = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let row = tx
                .query_row(
                    "SELECT id, payload, attempts, max_attempts, run_at, last_error,
                            created_at, updated_at
                     FROM jobs WHERE status = 'queued' AND run_at <= ?1
                     ORDER BY run_at, created_at LIMIT 1",
                    params![now],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some(row) => {
                    tx.execute(
                        "UPDATE jobs SET status = 'running', updated_at = ?1 WHERE id = ?2",
                        params![now, row.0],
                    )?;
                    tx.commit()?;
                    Some(row)
                }
                None => None,
            }
        };

        let Some((id, encoded, attempts, max_attempts, run_at, last_error, created_at, updated_at)) =
            claimed
        else {
            return Ok(None);
        };

        match serde_json::from_str::<JobPayload>(&encoded) {
            Ok(payload) => Ok(Some(Job {
                id,
                payload,
                status: JobStatus::Running,
                attempts,
                max_attempts,
                run_at,
                last_error,
                created_at,
                updated_at,
            })),
            Err(e) => {
                error!(job_id = %id, "unparseable job payload, parking as failed: {e}");
                self.park_failed(&id, &format!("unparseable payload: {e}"))
                    .await?;
                Ok(None)
            }
        }
    }

    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = 'done', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), job_id],
        )?;
        Ok(())
    }

    /// Record a failed execution: re-queue with backoff until attempts run
    /// out, then park as failed for operator attention.
    pub async fn fail(&self, job: &Job, error_msg: &str) -> Result<JobStatus, QueueError> {
        let attempts = job.attempts + 1;
        let now = Utc::now().timestamp();
        if attempts >= job.max_attempts {
            error!(
                job_id = %job.id,
                kind = job.payload.kind(),
                attempts,
                "job failed permanently, operator attention required: {error_msg}"
            );
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE jobs SET status = 'failed', attempts = ?1, last_error = ?2,
                        updated_at = ?3
                 WHERE id = ?4",
                params![attempts, error_msg, now, job.id],
            )?;
            return Ok(JobStatus::Failed);
        }

        let delay = self.backoff_delay(attempts);
        warn!(
            job_id = %job.id,
            kind = job.payload.kind(),
            attempts,
            retry_in_secs = delay,
            "job failed, re-queued: {error_msg}"
        );
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = 'queued', attempts = ?1, last_error = ?2,
                    run_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![attempts, error_msg, now + delay, now, job.id],
        )?;
        Ok(JobStatus::Queued)
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut depth = QueueDepth::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status {
                JobStatus::Queued => depth.queued = count,
                JobStatus::Running => depth.running = count,
                JobStatus::Done => depth.done = count,
                JobStatus::Failed => depth.failed = count,
            }
        }
        Ok(depth)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT id, payload, status, attempts, max_attempts, run_at, last_error,
                        created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, JobStatus>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?
        };
        let Some((id, encoded, status, attempts, max_attempts, run_at, last_error, created_at, updated_at)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(Job {
            id,
            payload: serde_json::from_str(&encoded)?,
            status,
            attempts,
            max_attempts,
            run_at,
            last_error,
            created_at,
            updated_at,
        }))
    }

    async fn park_failed(&self, job_id: &str, error_msg: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error_msg, Utc::now().timestamp(), job_id],
        )?;
        Ok(())
    }

    /// base * 2^(n-1) seconds plus a little jitter so retries from one
    /// incident spread out.
    fn backoff_delay(&self, attempts: u32) -> i64 {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self.base_delay_secs.saturating_mul(1u64 << exp) as i64;
        base + rand::thread_rng().gen_range(0..=1)
    }
}

/// What a worker does with a claimed payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> anyhow::Result<()>;
}

pub struct QueueWorker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
}

impl QueueWorker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    /// Claim and execute one due job. Returns whether anything ran.
    pub async fn process_next(&self, now: i64) -> Result<bool, QueueError> {
        let Some(job) = self.queue.claim_due(now).await? else {
            return Ok(false);
        };
        debug!(job_id = %job.id, kind = job.payload.kind(), attempt = job.attempts + 1, "executing job");
        match self.handler.handle(&job.payload).await {
            Ok(()) => {
                self.queue.complete(&job.id).await?;
            }
            Err(e) => {
                self.queue.fail(&job, &format!("{e:#}")).await?;
            }
        }
        Ok(true)
    }

    /// Poll loop: drain everything due, then sleep until the next tick.
    pub fn spawn(self, poll_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
            loop {
                ticker.tick().await;
                loop {
                    match self.process_next(Utc::now().timestamp()).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            warn!("queue worker error: {e}");
                            break;
                        }
                    }
                }
            }
        })
    }
}
