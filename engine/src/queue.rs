use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::ModelId;

/// A deferred unit of work. Serialized into the queue payload; the runner
/// dispatches on the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    RebuildSegment { segment_id: ModelId },
    RebuildAllSegments { business_id: ModelId },
    CreateSystemSegments { business_id: ModelId },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::RebuildSegment { .. } => "rebuild_segment",
            Job::RebuildAllSegments { .. } => "rebuild_all_segments",
            Job::CreateSystemSegments { .. } => "create_system_segments",
        }
    }
}

/// Bounded retries with a fixed countdown between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub countdown_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            countdown_secs: 60,
        }
    }
}

/// A claimed job: `attempts` counts this claim too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: i64,
    pub job: Job,
    pub attempts: u32,
}

/// The single submission abstraction: callers enqueue, an implementation
/// decides how and when the work actually runs. Rebuild logic itself lives
/// in one place regardless of the path taken.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit for immediate execution.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Submit with a fixed countdown before the job becomes due.
    async fn enqueue_delayed(&self, job: Job, countdown_secs: i64) -> Result<()>;

    /// Claim the oldest due job, incrementing its attempt counter. A claimed
    /// job stays invisible until resolved via `mark_done`, `mark_failed` or
    /// `retry_later`.
    async fn fetch_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>>;

    async fn mark_done(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Put a claimed job back in the queue, due again at `due`.
    async fn retry_later(&self, id: i64, due: DateTime<Utc>) -> Result<()>;

    /// Jobs waiting to be claimed, due or not.
    async fn pending(&self) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    id: i64,
    job: Job,
    attempts: u32,
    due_at: DateTime<Utc>,
    status: EntryStatus,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    entries: Vec<Entry>,
}

/// In-process queue for tests and the synchronous fallback path.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, job: Job, due_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push(Entry {
            id,
            job,
            attempts: 0,
            due_at,
            status: EntryStatus::Queued,
            last_error: None,
        });
        Ok(())
    }

    async fn update<F>(&self, id: i64, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Entry),
    {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        apply(entry);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.push(job, Utc::now()).await
    }

    async fn enqueue_delayed(&self, job: Job, countdown_secs: i64) -> Result<()> {
        self.push(job, Utc::now() + Duration::seconds(countdown_secs))
            .await
    }

    async fn fetch_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut state = self.state.lock().await;
        let candidate = state
            .entries
            .iter_mut()
            .filter(|e| e.status == EntryStatus::Queued && e.due_at <= now)
            .min_by_key(|e| (e.due_at, e.id));
        match candidate {
            Some(entry) => {
                entry.status = EntryStatus::Running;
                entry.attempts += 1;
                debug!("claimed job {} ({})", entry.id, entry.job.kind());
                Ok(Some(QueuedJob {
                    id: entry.id,
                    job: entry.job.clone(),
                    attempts: entry.attempts,
                }))
            }
            None => Ok(None),
        }
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        self.update(id, |e| e.status = EntryStatus::Done).await
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        self.update(id, move |e| {
            e.status = EntryStatus::Failed;
            e.last_error = Some(error);
        })
        .await
    }

    async fn retry_later(&self, id: i64, due: DateTime<Utc>) -> Result<()> {
        self.update(id, move |e| {
            e.status = EntryStatus::Queued;
            e.due_at = due;
        })
        .await
    }

    async fn pending(&self) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Queued)
            .count() as i64)
    }
}

/// Durable queue backed by the engine's SQLite database.
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, job: &Job, due_at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs (payload, status, attempts, due_at, created_at, updated_at)
            VALUES (?, 'queued', 0, ?, ?, ?)
            "#,
        )
        .bind(serde_json::to_string(job)?)
        .bind(due_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        info!("enqueued {} job", job.kind());
        Ok(())
    }

    async fn set_status(&self, id: i64, status: &str, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.insert(&job, Utc::now()).await
    }

    async fn enqueue_delayed(&self, job: Job, countdown_secs: i64) -> Result<()> {
        self.insert(&job, Utc::now() + Duration::seconds(countdown_secs))
            .await
    }

    async fn fetch_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND due_at <= ?
                ORDER BY due_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let payload: String = row.try_get("payload")?;
                let attempts: i64 = row.try_get("attempts")?;
                let job: Job = serde_json::from_str(&payload)?;
                debug!("claimed job {} ({})", id, job.kind());
                Ok(Some(QueuedJob {
                    id,
                    job,
                    attempts: attempts as u32,
                }))
            }
            None => Ok(None),
        }
    }

    async fn mark_done(&self, id: i64) -> Result<()> {
        self.set_status(id, "done", None).await
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.set_status(id, "failed", Some(error)).await
    }

    async fn retry_later(&self, id: i64, due: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', due_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(due)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn pending(&self) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
