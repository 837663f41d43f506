use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::{
    Business, Customer, EventFilter, EventStats, ModelId, NewIssueRecord, NewRiskEvent,
    NewSegment, RebuildStats, RiskEvent, Segment,
};
use crate::segments::CompiledFilter;

pub mod sqlite;

pub use sqlite::SqliteStorage;

/// Read/write access to the per-business configuration blob.
#[async_trait]
pub trait BusinessStorage: Send + Sync {
    async fn get_business(&self, id: ModelId) -> Result<Business>;
    async fn save_settings(&self, id: ModelId, settings: &Value) -> Result<()>;
}

/// Coupon issuance history: the windowed frequency counters on the issue
/// path all resolve against this store.
#[async_trait]
pub trait ActivityStorage: Send + Sync {
    async fn record_issue(&self, record: &NewIssueRecord) -> Result<ModelId>;

    /// Issues recorded from `ip` for the business since `since`.
    async fn count_issues_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Issues recorded for `phone` for the business since `since`.
    async fn count_issues_for_phone(
        &self,
        business_id: ModelId,
        phone: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Distinct phones issued to from `ip` for the business since `since`.
    async fn count_distinct_phones_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;
}

/// The scoring audit trail. The scorer is both producer and consumer: the
/// redemption-burst counter reads back what earlier calls wrote.
#[async_trait]
pub trait RiskEventStorage: Send + Sync {
    async fn save_event(&self, event: &NewRiskEvent) -> Result<ModelId>;
    async fn get_event(&self, id: ModelId) -> Result<RiskEvent>;

    /// Redeem-kind events recorded from `ip` for the business since `since`.
    async fn count_redeems_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Newest-first listing for operator review.
    async fn recent_events(
        &self,
        business_id: ModelId,
        filter: &EventFilter,
        limit: i64,
    ) -> Result<Vec<RiskEvent>>;

    async fn event_stats(&self, business_id: ModelId) -> Result<EventStats>;

    /// Marks an event as handled by an operator; the only mutation an event
    /// ever sees.
    async fn resolve_event(&self, id: ModelId) -> Result<()>;
}

/// Segments, their membership, and the customer selections feeding them.
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    async fn get_segment(&self, id: ModelId) -> Result<Segment>;
    async fn list_enabled_segments(&self, business_id: ModelId) -> Result<Vec<Segment>>;

    /// Get-or-create keyed by (business, slug). An existing row is returned
    /// untouched even when the supplied definition differs. The bool reports
    /// whether a row was created.
    async fn get_or_create_segment(&self, segment: &NewSegment) -> Result<(Segment, bool)>;

    /// The rebuild write path, executed as one transaction: delete current
    /// members (dynamic segments only), select matching customers up to
    /// `cap`, insert membership in batches, and persist size/preview/
    /// last_built_at together.
    async fn replace_membership(
        &self,
        segment: &Segment,
        filter: &CompiledFilter,
        cap: i64,
        now: DateTime<Utc>,
    ) -> Result<RebuildStats>;

    /// Read-only selection of matching phone numbers; shares the filter SQL
    /// with [`Self::replace_membership`] and mutates nothing.
    async fn select_preview(&self, filter: &CompiledFilter, limit: i64) -> Result<Vec<String>>;

    /// Full customer rows for the segment's current members.
    async fn member_customers(&self, segment_id: ModelId) -> Result<Vec<Customer>>;
}
