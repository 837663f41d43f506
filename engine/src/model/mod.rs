use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display as EnumDisplay, EnumString};

pub type ModelId = i64;

/// Hours after which a built segment is considered stale.
pub const SEGMENT_STALE_AFTER_HOURS: i64 = 24;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumDisplay, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Decision {
    Allow,
    Warn,
    Block,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumDisplay, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskKind {
    Issue,
    Redeem,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumDisplay, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SegmentKind {
    System,
    Custom,
}

/// Denylist bucket targeted by the operator "add to denylist" action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DenyType {
    Ip,
    Phone,
    Utm,
}

impl DenyType {
    pub fn settings_key(&self) -> String {
        format!("{}_deny", self)
    }
}

/// Audit record of one scoring decision. Immutable except `resolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: ModelId,
    pub business_id: ModelId,
    pub kind: RiskKind,
    pub campaign_id: Option<ModelId>,
    pub coupon_id: Option<ModelId>,
    pub phone: String,
    pub ip: Option<String>,
    pub ua: String,
    pub utm: BTreeMap<String, String>,
    pub score: i64,
    pub reasons: Vec<String>,
    pub decision: Decision,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRiskEvent {
    pub business_id: ModelId,
    pub kind: RiskKind,
    pub campaign_id: Option<ModelId>,
    pub coupon_id: Option<ModelId>,
    pub phone: String,
    pub ip: Option<String>,
    pub ua: String,
    pub utm: BTreeMap<String, String>,
    pub score: i64,
    pub reasons: Vec<String>,
    pub decision: Decision,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Business {
    pub id: ModelId,
    pub name: String,
    pub settings: Option<serde_json::Value>,
}

/// Customer projection consumed by the segment engine. The engine only ever
/// reads these fields; ownership of the customer lifecycle sits elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: ModelId,
    pub business_id: ModelId,
    pub phone_e164: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_issue_at: Option<DateTime<Utc>>,
    pub last_redeem_at: Option<DateTime<Utc>>,
    pub issues_count: i64,
    pub redeems_count: i64,
    pub redeem_amount_total: f64,
    pub recency_days: i64,
    pub r_score: i64,
    pub f_score: i64,
    pub m_score: i64,
}

/// Customer row as written by the import/backfill flow (no id yet).
#[derive(Debug, Clone, Default)]
pub struct NewCustomer {
    pub business_id: ModelId,
    pub phone_e164: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_issue_at: Option<DateTime<Utc>>,
    pub last_redeem_at: Option<DateTime<Utc>>,
    pub issues_count: i64,
    pub redeems_count: i64,
    pub redeem_amount_total: f64,
    pub recency_days: i64,
    pub r_score: i64,
    pub f_score: i64,
    pub m_score: i64,
}

/// One coupon issuance, as recorded by the issuing flow. Drives the
/// windowed frequency counters on the issue path.
#[derive(Debug, Clone)]
pub struct IssueRecord {
    pub id: ModelId,
    pub business_id: ModelId,
    pub campaign_id: Option<ModelId>,
    pub phone: String,
    pub ip: Option<String>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIssueRecord {
    pub business_id: ModelId,
    pub campaign_id: Option<ModelId>,
    pub phone: String,
    pub ip: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// A named, versioned rule bundle over the customer store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: ModelId,
    pub business_id: ModelId,
    pub name: String,
    pub slug: String,
    pub kind: SegmentKind,
    pub definition: serde_json::Value,
    pub is_dynamic: bool,
    pub size_cached: i64,
    pub preview: Vec<String>,
    pub last_built_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub description: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    /// A segment is stale when it has never been built or was built more
    /// than [`SEGMENT_STALE_AFTER_HOURS`] ago.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_built_at {
            None => true,
            Some(built) => built < now - Duration::hours(SEGMENT_STALE_AFTER_HOURS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSegment {
    pub business_id: ModelId,
    pub name: String,
    pub slug: String,
    pub kind: SegmentKind,
    pub definition: serde_json::Value,
    pub is_dynamic: bool,
    pub enabled: bool,
    pub description: String,
    pub color: String,
}

#[derive(Debug, Clone)]
pub struct SegmentMember {
    pub segment_id: ModelId,
    pub customer_id: ModelId,
    pub added_at: DateTime<Utc>,
}

/// Optional filters for the operator risk-event listing.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<RiskKind>,
    pub decision: Option<Decision>,
    pub resolved: Option<bool>,
    pub phone: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStats {
    pub total: i64,
    pub blocks: i64,
    pub warns: i64,
    pub unresolved: i64,
}

/// Result of one segment rebuild: the cached size and masked preview that
/// were written alongside the membership rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildStats {
    pub size: i64,
    pub preview: Vec<String>,
}
