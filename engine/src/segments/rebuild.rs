use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::model::{ModelId, NewSegment, RebuildStats, Segment, SegmentKind};
use crate::queue::{Job, JobQueue};
use crate::segments::catalog::SYSTEM_SEGMENTS;
use crate::segments::compiler::{validate_definition, SegmentFilter};
use crate::segments::{mask_phone, slugify};
use crate::storage::SegmentStorage;

/// Hard cap on customers materialized per rebuild. Excess matches are
/// silently truncated, never an error.
pub const MAX_SEGMENT_SIZE: i64 = 50_000;

/// Upper bound for the read-only preview endpoint.
pub const PREVIEW_LIMIT: i64 = 10;

const DEFAULT_SEGMENT_COLOR: &str = "#3B82F6";

/// Materializes segment membership. One rebuilder instance serializes
/// rebuilds per segment id; rebuilds of different segments run freely in
/// parallel. The delete-then-insert sequence is not safe under two
/// concurrent writers on the same segment, so the lock is required, not
/// an optimization.
pub struct SegmentRebuilder {
    storage: Arc<dyn SegmentStorage>,
    queue: Arc<dyn JobQueue>,
    locks: StdMutex<HashMap<ModelId, Arc<AsyncMutex<()>>>>,
}

impl SegmentRebuilder {
    pub fn new(storage: Arc<dyn SegmentStorage>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            storage,
            queue,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn rebuild(&self, segment_id: ModelId) -> Result<RebuildStats> {
        self.rebuild_at(segment_id, Utc::now()).await
    }

    /// Recomputes membership for one segment, anchored at `now`. Dynamic
    /// segments get replace-all semantics: the whole member set is deleted
    /// and re-inserted, so `added_at` is not a stable first-qualified
    /// timestamp. Size, preview and last_built_at are written in the same
    /// transaction as the membership rows.
    pub async fn rebuild_at(&self, segment_id: ModelId, now: DateTime<Utc>) -> Result<RebuildStats> {
        let lock = self.segment_lock(segment_id);
        let _guard = lock.lock().await;

        let segment = self.storage.get_segment(segment_id).await?;
        if !segment.enabled {
            return Err(EngineError::NotFound(format!(
                "segment {} is disabled",
                segment_id
            )));
        }

        let started = Instant::now();
        let filter = SegmentFilter::compile(segment.business_id, &segment.definition);
        let stats = self
            .storage
            .replace_membership(&segment, &filter.to_sql(now), MAX_SEGMENT_SIZE, now)
            .await?;

        info!(
            "segment '{}' ({}) rebuilt: {} members in {:.2?}",
            segment.name,
            segment_id,
            stats.size,
            started.elapsed()
        );
        Ok(stats)
    }

    /// Evaluates a definition without touching any segment row or member:
    /// same compiler, same selection SQL, zero writes.
    pub async fn preview(
        &self,
        business_id: ModelId,
        definition: &Value,
        limit: i64,
    ) -> Result<Vec<String>> {
        let filter = SegmentFilter::compile(business_id, definition);
        let phones = self
            .storage
            .select_preview(&filter.to_sql(Utc::now()), limit.min(PREVIEW_LIMIT))
            .await?;
        Ok(phones.iter().map(|phone| mask_phone(phone)).collect())
    }

    /// Seeds the system catalog for a business. Existing slugs are left
    /// untouched (get-or-create, not upsert); only newly-created segments
    /// are queued for an immediate rebuild. Safe to call repeatedly.
    pub async fn create_system_segments(&self, business_id: ModelId) -> Result<u32> {
        let mut created_count = 0;
        for entry in SYSTEM_SEGMENTS.iter() {
            let (segment, created) = self
                .storage
                .get_or_create_segment(&NewSegment {
                    business_id,
                    name: entry.name.to_string(),
                    slug: entry.slug.to_string(),
                    kind: SegmentKind::System,
                    definition: entry.definition.clone(),
                    is_dynamic: true,
                    enabled: true,
                    description: entry.description.to_string(),
                    color: entry.color.to_string(),
                })
                .await?;
            if created {
                created_count += 1;
                self.queue
                    .enqueue(Job::RebuildSegment {
                        segment_id: segment.id,
                    })
                    .await?;
                info!("created system segment '{}' for business {}", segment.slug, business_id);
            }
        }
        Ok(created_count)
    }

    /// Queues a rebuild for every enabled segment of the business.
    pub async fn rebuild_all(&self, business_id: ModelId) -> Result<u32> {
        let segments = self.storage.list_enabled_segments(business_id).await?;
        let count = segments.len() as u32;
        for segment in segments {
            self.queue
                .enqueue(Job::RebuildSegment {
                    segment_id: segment.id,
                })
                .await?;
        }
        info!("queued rebuild for {} segments of business {}", count, business_id);
        Ok(count)
    }

    /// Creates a custom segment after strict validation, deriving the slug
    /// from the name when none is given, and queues its first rebuild.
    pub async fn create_custom_segment(
        &self,
        business_id: ModelId,
        name: &str,
        slug: Option<&str>,
        definition: Value,
        description: &str,
        color: Option<&str>,
    ) -> Result<Segment> {
        validate_definition(&definition).map_err(EngineError::Validation)?;
        let slug = match slug {
            Some(slug) => slug.to_string(),
            None => slugify(name),
        };
        if slug.is_empty() {
            return Err(EngineError::Validation(
                "segment name yields an empty slug".to_string(),
            ));
        }

        let (segment, created) = self
            .storage
            .get_or_create_segment(&NewSegment {
                business_id,
                name: name.to_string(),
                slug,
                kind: SegmentKind::Custom,
                definition,
                is_dynamic: true,
                enabled: true,
                description: description.to_string(),
                color: color.unwrap_or(DEFAULT_SEGMENT_COLOR).to_string(),
            })
            .await?;
        if !created {
            return Err(EngineError::Validation(format!(
                "segment slug '{}' already exists",
                segment.slug
            )));
        }

        self.queue
            .enqueue(Job::RebuildSegment {
                segment_id: segment.id,
            })
            .await?;
        Ok(segment)
    }

    fn segment_lock(&self, segment_id: ModelId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("segment lock registry poisoned");
        locks
            .entry(segment_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
