use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

use crate::error::Result;
use crate::queue::{Job, JobQueue, RetryPolicy};
use crate::segments::SegmentRebuilder;

/// Drains the job queue and dispatches into the rebuild engine. A failed
/// job is re-queued with the policy's fixed countdown until its retries are
/// exhausted, then dead-lettered as failed; the runner itself never stops
/// over a job error.
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    rebuilder: Arc<SegmentRebuilder>,
    policy: RetryPolicy,
}

impl JobRunner {
    pub fn new(queue: Arc<dyn JobQueue>, rebuilder: Arc<SegmentRebuilder>) -> Self {
        Self::with_policy(queue, rebuilder, RetryPolicy::default())
    }

    pub fn with_policy(
        queue: Arc<dyn JobQueue>,
        rebuilder: Arc<SegmentRebuilder>,
        policy: RetryPolicy,
    ) -> Self {
        info!("initializing job runner (max_retries={})", policy.max_retries);
        Self {
            queue,
            rebuilder,
            policy,
        }
    }

    pub async fn run_once(&self) -> Result<Option<Job>> {
        self.run_once_at(Utc::now()).await
    }

    /// Claims and executes at most one due job. Returns the job when one
    /// was claimed (whether it succeeded or not), `None` on an empty queue.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let Some(claimed) = self.queue.fetch_next(now).await? else {
            trace!("no jobs due");
            return Ok(None);
        };

        match self.dispatch(&claimed.job).await {
            Ok(()) => {
                self.queue.mark_done(claimed.id).await?;
            }
            Err(e) => {
                // attempts counts the initial try; retries are what follow it
                if claimed.attempts > self.policy.max_retries {
                    error!(
                        "job {} ({}) failed after {} attempts: {}",
                        claimed.id,
                        claimed.job.kind(),
                        claimed.attempts,
                        e
                    );
                    self.queue.mark_failed(claimed.id, &e.to_string()).await?;
                } else {
                    warn!(
                        "job {} ({}) failed (attempt {}), retrying in {}s: {}",
                        claimed.id,
                        claimed.job.kind(),
                        claimed.attempts,
                        self.policy.countdown_secs,
                        e
                    );
                    self.queue
                        .retry_later(claimed.id, now + Duration::seconds(self.policy.countdown_secs))
                        .await?;
                }
            }
        }
        Ok(Some(claimed.job))
    }

    /// Runs due jobs until the queue yields nothing. Meant for tests and
    /// the synchronous fallback path; retried jobs scheduled in the future
    /// are left alone.
    pub async fn drain(&self) -> Result<u32> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// The worker loop: poll, execute, sleep when idle.
    pub async fn run_forever(&self, sleep_ms: u64) -> Result<()> {
        info!("job runner started (idle sleep {}ms)", sleep_ms);
        loop {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                }
                Err(e) => {
                    // queue-level failure: back off instead of spinning
                    error!("job runner cycle failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                }
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<()> {
        match job {
            Job::RebuildSegment { segment_id } => {
                self.rebuilder.rebuild(*segment_id).await?;
            }
            Job::RebuildAllSegments { business_id } => {
                self.rebuilder.rebuild_all(*business_id).await?;
            }
            Job::CreateSystemSegments { business_id } => {
                self.rebuilder.create_system_segments(*business_id).await?;
            }
        }
        Ok(())
    }
}
