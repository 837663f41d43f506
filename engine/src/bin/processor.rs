use std::sync::Arc;

use anyhow::anyhow;
use engine::{
    executable_utils::initialize_executable,
    processor::JobRunner,
    queue::{RetryPolicy, SqliteQueue},
    segments::SegmentRebuilder,
    storage::SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = initialize_executable().map_err(|e| anyhow!(e))?;

    let storage = Arc::new(SqliteStorage::new(&config.common.database_url).await?);
    storage.initialize_schema().await?;

    let queue = Arc::new(SqliteQueue::new(storage.pool().clone()));
    let rebuilder = Arc::new(SegmentRebuilder::new(storage.clone(), queue.clone()));

    let mut policy = RetryPolicy::default();
    if let Some(max_retries) = config.processor.max_retries {
        policy.max_retries = max_retries;
    }
    if let Some(countdown) = config.processor.retry_countdown_secs {
        policy.countdown_secs = countdown;
    }

    let runner = JobRunner::with_policy(queue, rebuilder, policy);
    runner.run_forever(config.processor.sleep_ms).await?;

    Ok(())
}
