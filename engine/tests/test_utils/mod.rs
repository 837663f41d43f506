#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use engine::model::{ModelId, NewCustomer, NewIssueRecord};
use engine::storage::{ActivityStorage, SqliteStorage};

pub async fn memory_storage() -> Arc<SqliteStorage> {
    let storage = SqliteStorage::new("sqlite::memory:")
        .await
        .expect("failed to open in-memory storage");
    storage
        .initialize_schema()
        .await
        .expect("failed to initialize schema");
    Arc::new(storage)
}

pub async fn create_business(storage: &SqliteStorage, settings: Option<Value>) -> ModelId {
    let name = common::test_helpers::generate_unique_id("BIZ");
    storage
        .create_business(&name, settings.as_ref())
        .await
        .expect("failed to create business")
}

pub fn customer(business_id: ModelId, phone: &str) -> NewCustomer {
    NewCustomer {
        business_id,
        phone_e164: phone.to_string(),
        ..NewCustomer::default()
    }
}

pub fn customer_with_recency(business_id: ModelId, phone: &str, recency_days: i64) -> NewCustomer {
    NewCustomer {
        recency_days,
        ..customer(business_id, phone)
    }
}

pub fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days)
}

pub async fn seed_issues(
    storage: &SqliteStorage,
    business_id: ModelId,
    ip: Option<&str>,
    phone: &str,
    count: usize,
    issued_at: DateTime<Utc>,
) {
    for _ in 0..count {
        storage
            .record_issue(&NewIssueRecord {
                business_id,
                campaign_id: Some(1),
                phone: phone.to_string(),
                ip: ip.map(str::to_string),
                issued_at,
            })
            .await
            .expect("failed to seed issue record");
    }
}
