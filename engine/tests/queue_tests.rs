mod test_utils;

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use engine::processor::JobRunner;
use engine::queue::{InMemoryQueue, Job, JobQueue, RetryPolicy, SqliteQueue};
use engine::segments::SegmentRebuilder;

use test_utils::{create_business, customer_with_recency, memory_storage};

#[tokio::test]
async fn in_memory_queue_is_fifo_for_due_jobs() {
    let queue = InMemoryQueue::new();
    queue.enqueue(Job::RebuildSegment { segment_id: 1 }).await.unwrap();
    queue.enqueue(Job::RebuildSegment { segment_id: 2 }).await.unwrap();

    let now = Utc::now();
    let first = queue.fetch_next(now).await.unwrap().unwrap();
    assert_eq!(first.job, Job::RebuildSegment { segment_id: 1 });
    assert_eq!(first.attempts, 1);
    let second = queue.fetch_next(now).await.unwrap().unwrap();
    assert_eq!(second.job, Job::RebuildSegment { segment_id: 2 });

    // claimed jobs are invisible until resolved
    assert!(queue.fetch_next(now).await.unwrap().is_none());
    queue.mark_done(first.id).await.unwrap();
    queue.mark_done(second.id).await.unwrap();
    assert_eq!(queue.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn delayed_jobs_only_become_due_after_their_countdown() {
    let queue = InMemoryQueue::new();
    queue
        .enqueue_delayed(Job::CreateSystemSegments { business_id: 1 }, 300)
        .await
        .unwrap();

    let now = Utc::now();
    assert!(queue.fetch_next(now).await.unwrap().is_none());
    assert_eq!(queue.pending().await.unwrap(), 1);

    let later = now + Duration::seconds(301);
    let claimed = queue.fetch_next(later).await.unwrap().unwrap();
    assert_eq!(claimed.job, Job::CreateSystemSegments { business_id: 1 });
}

#[tokio::test]
async fn sqlite_queue_round_trips_jobs() {
    let storage = memory_storage().await;
    let queue = SqliteQueue::new(storage.pool().clone());

    queue.enqueue(Job::RebuildAllSegments { business_id: 7 }).await.unwrap();
    assert_eq!(queue.pending().await.unwrap(), 1);

    let claimed = queue.fetch_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.job, Job::RebuildAllSegments { business_id: 7 });
    assert_eq!(claimed.attempts, 1);
    assert_eq!(queue.pending().await.unwrap(), 0);

    // a claimed job is not handed out twice
    assert!(queue.fetch_next(Utc::now()).await.unwrap().is_none());

    queue.mark_done(claimed.id).await.unwrap();
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
        .bind(claimed.id)
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(status, "done");
}

#[tokio::test]
async fn sqlite_queue_retry_later_requeues_with_new_due_time() {
    let storage = memory_storage().await;
    let queue = SqliteQueue::new(storage.pool().clone());
    queue.enqueue(Job::RebuildSegment { segment_id: 3 }).await.unwrap();

    let now = Utc::now();
    let claimed = queue.fetch_next(now).await.unwrap().unwrap();
    queue.retry_later(claimed.id, now + Duration::seconds(60)).await.unwrap();

    assert!(queue.fetch_next(now).await.unwrap().is_none());
    let retried = queue
        .fetch_next(now + Duration::seconds(61))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.id, claimed.id);
    assert_eq!(retried.attempts, 2);
}

#[tokio::test]
async fn runner_retries_with_fixed_countdown_then_dead_letters() {
    let storage = memory_storage().await;
    let queue = Arc::new(SqliteQueue::new(storage.pool().clone()));
    let rebuilder = Arc::new(SegmentRebuilder::new(storage.clone(), queue.clone()));
    let runner = JobRunner::with_policy(
        queue.clone(),
        rebuilder,
        RetryPolicy {
            max_retries: 2,
            countdown_secs: 60,
        },
    );

    // no such segment: every attempt fails with NotFound
    queue.enqueue(Job::RebuildSegment { segment_id: 9999 }).await.unwrap();

    let t0 = Utc::now();
    // initial attempt + two retries, each only due after the fixed countdown
    assert!(runner.run_once_at(t0).await.unwrap().is_some());
    assert!(runner.run_once_at(t0).await.unwrap().is_none(), "retry not due yet");
    assert!(runner.run_once_at(t0 + Duration::seconds(61)).await.unwrap().is_some());
    assert!(runner.run_once_at(t0 + Duration::seconds(122)).await.unwrap().is_some());

    // retries exhausted: the job is failed, not re-queued
    assert!(runner.run_once_at(t0 + Duration::seconds(300)).await.unwrap().is_none());
    assert_eq!(queue.pending().await.unwrap(), 0);

    let (status, attempts, last_error): (String, i64, Option<String>) =
        sqlx::query_as("SELECT status, attempts, last_error FROM jobs LIMIT 1")
            .fetch_one(storage.pool())
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(attempts, 3);
    assert!(last_error.unwrap().contains("not found"));
}

#[tokio::test]
async fn runner_drains_seeded_segment_rebuilds() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    storage
        .insert_customer(&customer_with_recency(business_id, "77010000001", 3))
        .await
        .unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    let rebuilder = Arc::new(SegmentRebuilder::new(storage.clone(), queue.clone()));
    let runner = JobRunner::new(queue.clone(), rebuilder.clone());

    rebuilder.create_system_segments(business_id).await.unwrap();
    let processed = runner.drain().await.unwrap();
    assert_eq!(processed, 5);

    use engine::storage::SegmentStorage;
    let segments = storage.list_enabled_segments(business_id).await.unwrap();
    assert_eq!(segments.len(), 5);
    assert!(segments.iter().all(|s| s.last_built_at.is_some()));

    // a customer with recency 3 is nowhere near dormant
    let dormant = segments.iter().find(|s| s.slug == "dormant").unwrap();
    assert_eq!(dormant.size_cached, 0);
}

#[tokio::test]
async fn job_payloads_round_trip_through_serde() {
    let job = Job::RebuildSegment { segment_id: 42 };
    let payload = serde_json::to_value(&job).unwrap();
    assert_eq!(payload, json!({"job": "rebuild_segment", "segment_id": 42}));
    let back: Job = serde_json::from_value(payload).unwrap();
    assert_eq!(back, job);
}
