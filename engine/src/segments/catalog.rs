use once_cell::sync::Lazy;
use serde_json::{json, Value};

/// A system segment as shipped with the platform. Seeded per business on
/// first access; existing rows are never overwritten by re-seeding.
#[derive(Debug, Clone)]
pub struct SystemSegment {
    pub slug: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub color: &'static str,
    pub definition: Value,
}

pub static SYSTEM_SEGMENTS: Lazy<Vec<SystemSegment>> = Lazy::new(|| {
    vec![
        SystemSegment {
            slug: "new",
            name: "New customers",
            description: "Customers first seen within the last 7 days",
            color: "#10B981",
            definition: json!({
                "logic": "all",
                "conds": [
                    {"field": "first_seen_days_ago", "op": "<=", "value": 7}
                ]
            }),
        },
        SystemSegment {
            slug: "active",
            name: "Active customers",
            description: "Customers active within 14 days with 2+ redemptions",
            color: "#F59E0B",
            definition: json!({
                "logic": "all",
                "conds": [
                    {"field": "recency_days", "op": "<=", "value": 14},
                    {"field": "redeems_count", "op": ">=", "value": 2}
                ]
            }),
        },
        SystemSegment {
            slug: "vip",
            name: "VIP customers",
            description: "Customers with top RFM scores",
            color: "#8B5CF6",
            definition: json!({
                "logic": "all",
                "conds": [
                    {"field": "r_score", "op": ">=", "value": 4},
                    {"field": "f_score", "op": ">=", "value": 4},
                    {"field": "m_score", "op": ">=", "value": 4}
                ]
            }),
        },
        SystemSegment {
            slug: "churn_risk",
            name: "Churn risk",
            description: "Customers inactive for 45+ days who have redeemed before",
            color: "#EF4444",
            definition: json!({
                "logic": "all",
                "conds": [
                    {"field": "recency_days", "op": ">=", "value": 45},
                    {"field": "redeems_count", "op": ">=", "value": 1}
                ]
            }),
        },
        SystemSegment {
            slug: "dormant",
            name: "Dormant customers",
            description: "Customers with no activity for more than 90 days",
            color: "#6B7280",
            definition: json!({
                "logic": "all",
                "conds": [
                    {"field": "recency_days", "op": ">=", "value": 90}
                ]
            }),
        },
    ]
});
