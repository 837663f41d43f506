mod test_utils;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use engine::context::ActorContext;
use engine::error::{EngineError, Result};
use engine::model::{Decision, ModelId, NewIssueRecord, NewRiskEvent, RiskKind};
use engine::scorers::RiskScorer;
use engine::storage::{ActivityStorage, RiskEventStorage, SqliteStorage};

use test_utils::{create_business, memory_storage, seed_issues};

fn scorer(storage: &Arc<SqliteStorage>) -> RiskScorer {
    RiskScorer::new(storage.clone(), storage.clone(), storage.clone())
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn ctx_with_utm(ip: &str, utm: &[(&str, &str)]) -> ActorContext {
    let mut map = BTreeMap::new();
    for (key, value) in utm {
        map.insert(key.to_string(), value.to_string());
    }
    ActorContext {
        ip: Some(ip.to_string()),
        user_agent: "test-agent".to_string(),
        utm: map,
    }
}

#[tokio::test]
async fn allowlisted_ip_short_circuits_even_when_denied() {
    let storage = memory_storage().await;
    // the same ip on both lists: allow wins and nothing else runs
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {"ip_allow": ["1.2.3.4"], "ip_deny": ["1.2.3.4"]}})),
    )
    .await;
    let scorer = scorer(&storage);

    let outcome = scorer
        .score_issue_at(
            business_id,
            Some(1),
            &ActorContext::with_ip("1.2.3.4"),
            "77012345678",
            noon(),
        )
        .await;

    assert_eq!(outcome.score, 0);
    assert_eq!(outcome.decision, Decision::Allow);
    assert_eq!(outcome.reasons, vec!["ip_allow:0".to_string()]);

    // the audit event is written regardless
    let event = storage.get_event(outcome.event_id.unwrap()).await.unwrap();
    assert_eq!(event.kind, RiskKind::Issue);
    assert_eq!(event.score, 0);
    assert_eq!(event.decision, Decision::Allow);
    assert_eq!(event.reasons, vec!["ip_allow:0".to_string()]);
}

#[tokio::test]
async fn hard_deny_rules_accumulate_without_short_circuit() {
    let storage = memory_storage().await;
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {
            "ip_deny": ["10.0.0.9"],
            "phone_deny": ["77012345678"],
            "utm_deny": ["spam"]
        }})),
    )
    .await;
    let scorer = scorer(&storage);

    let ctx = ctx_with_utm("10.0.0.9", &[("utm_source", "SPAM-network")]);
    let outcome = scorer
        .score_issue_at(business_id, None, &ctx, "77012345678", noon())
        .await;

    assert_eq!(outcome.score, 250);
    assert_eq!(outcome.decision, Decision::Block);
    assert_eq!(
        outcome.reasons,
        vec![
            "ip_deny:+100".to_string(),
            "phone_deny:+100".to_string(),
            "utm_deny:+50".to_string()
        ]
    );
}

#[tokio::test]
async fn ip_issue_rate_counts_only_the_trailing_hour() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    let scorer = scorer(&storage);
    let now = noon();

    // 25 issues inside the window, 10 outside: the counter must see 25
    seed_issues(&storage, business_id, Some("10.1.1.1"), "701", 25, now - Duration::minutes(30)).await;
    seed_issues(&storage, business_id, Some("10.1.1.1"), "701", 10, now - Duration::hours(2)).await;

    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("10.1.1.1"), "", now)
        .await;

    // delta 5 over the default threshold of 20 -> 10 + min(40, 10)
    assert_eq!(outcome.score, 20);
    assert_eq!(outcome.decision, Decision::Warn);
    assert_eq!(outcome.reasons, vec!["ip_many_1h:+20 (25)".to_string()]);
}

#[tokio::test]
async fn phone_rate_fires_at_the_daily_threshold() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    let scorer = scorer(&storage);
    let now = noon();

    seed_issues(&storage, business_id, None, "77012345678", 2, now - Duration::hours(5)).await;

    let ctx = ActorContext::default();
    let outcome = scorer
        .score_issue_at(business_id, None, &ctx, "77012345678", now)
        .await;

    assert_eq!(outcome.score, 20);
    assert_eq!(outcome.reasons, vec!["phone_many_24h:+20 (2)".to_string()]);
    assert_eq!(outcome.decision, Decision::Warn);
}

#[tokio::test]
async fn distinct_phone_burst_from_one_ip() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    let scorer = scorer(&storage);
    let now = noon();

    for phone in ["701", "702", "703", "704", "705"] {
        seed_issues(&storage, business_id, Some("10.2.2.2"), phone, 1, now - Duration::minutes(5)).await;
    }

    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("10.2.2.2"), "", now)
        .await;

    assert_eq!(outcome.score, 15);
    assert_eq!(outcome.reasons, vec!["ip_burst_10m:+15 (5)".to_string()]);
    assert_eq!(outcome.decision, Decision::Allow);
}

#[tokio::test]
async fn night_hours_add_a_flat_penalty() {
    let storage = memory_storage().await;
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {"night_hours": [22, 6]}})),
    )
    .await;
    let scorer = scorer(&storage);
    let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 15, 0).unwrap();

    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::default(), "", late)
        .await;
    assert_eq!(outcome.score, 10);
    assert_eq!(outcome.reasons, vec!["night:+10".to_string()]);

    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::default(), "", noon())
        .await;
    assert_eq!(outcome.score, 0);
    assert!(outcome.reasons.is_empty());
}

#[tokio::test]
async fn each_triggering_condition_strictly_increases_the_score() {
    let storage = memory_storage().await;
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {
            "ip_deny": ["9.9.9.9"],
            "phone_deny": ["666"],
            "night_hours": [22, 6]
        }})),
    )
    .await;
    let scorer = scorer(&storage);
    let now = noon();

    let baseline = scorer
        .score_issue_at(business_id, None, &ActorContext::default(), "", now)
        .await;
    assert_eq!(baseline.score, 0);

    let denied_ip = scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("9.9.9.9"), "", now)
        .await;
    assert!(denied_ip.score > baseline.score);

    let denied_phone = scorer
        .score_issue_at(business_id, None, &ActorContext::default(), "666", now)
        .await;
    assert!(denied_phone.score > baseline.score);

    let at_night = scorer
        .score_issue_at(
            business_id,
            None,
            &ActorContext::default(),
            "",
            Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap(),
        )
        .await;
    assert!(at_night.score > baseline.score);

    seed_issues(&storage, business_id, None, "777", 3, now - Duration::hours(1)).await;
    let rate_excess = scorer
        .score_issue_at(business_id, None, &ActorContext::default(), "777", now)
        .await;
    assert!(rate_excess.score > baseline.score);
}

async fn scorer_for(
    storage: &Arc<SqliteStorage>,
    thresholds: serde_json::Value,
) -> (i64, RiskScorer) {
    let business_id = create_business(
        storage,
        Some(json!({"fraud": {"action_thresholds": thresholds}})),
    )
    .await;
    (
        business_id,
        RiskScorer::new(storage.clone(), storage.clone(), storage.clone()),
    )
}

#[tokio::test]
async fn decision_boundaries_are_exact() {
    let storage = memory_storage().await;
    let now = noon();

    // a phone at its daily threshold scores exactly 20
    let (business_id, s) = scorer_for(&storage, json!({"warn": 20, "block": 50})).await;
    seed_issues(&storage, business_id, None, "700", 2, now - Duration::hours(3)).await;
    let outcome = s.score_issue_at(business_id, None, &ActorContext::default(), "700", now).await;
    assert_eq!(outcome.score, 20);
    assert_eq!(outcome.decision, Decision::Warn, "score == warn threshold is warn");

    // the same score exactly at the block threshold blocks
    let (business_id, s) = scorer_for(&storage, json!({"warn": 10, "block": 20})).await;
    seed_issues(&storage, business_id, None, "700", 2, now - Duration::hours(3)).await;
    let outcome = s.score_issue_at(business_id, None, &ActorContext::default(), "700", now).await;
    assert_eq!(outcome.score, 20);
    assert_eq!(outcome.decision, Decision::Block, "score == block threshold is block");

    // one below the warn threshold stays allow
    let (business_id, s) = scorer_for(&storage, json!({"warn": 21, "block": 50})).await;
    seed_issues(&storage, business_id, None, "700", 2, now - Duration::hours(3)).await;
    let outcome = s.score_issue_at(business_id, None, &ActorContext::default(), "700", now).await;
    assert_eq!(outcome.score, 20);
    assert_eq!(outcome.decision, Decision::Allow, "one below warn stays allow");
}

#[tokio::test]
async fn every_scoring_call_writes_exactly_one_event() {
    let storage = memory_storage().await;
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {"ip_allow": ["1.1.1.1"], "ip_deny": ["2.2.2.2"]}})),
    )
    .await;
    let scorer = scorer(&storage);
    let now = noon();

    scorer.score_issue_at(business_id, None, &ActorContext::default(), "", now).await;
    scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("1.1.1.1"), "", now + Duration::seconds(1))
        .await;
    scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("2.2.2.2"), "", now + Duration::seconds(2))
        .await;

    let stats = storage.event_stats(business_id).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.unresolved, 3);

    // newest first
    let events = storage
        .recent_events(business_id, &Default::default(), 10)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert!(events[0].created_at >= events[1].created_at);
    assert!(events[1].created_at >= events[2].created_at);
    assert_eq!(events[0].decision, Decision::Block);
}

#[tokio::test]
async fn redeem_path_uses_the_reduced_rule_set() {
    let storage = memory_storage().await;
    let business_id = create_business(
        &storage,
        Some(json!({"fraud": {
            "ip_deny": ["10.3.3.3"],
            "phone_deny": ["77012345678"],
            "utm_deny": ["spam"]
        }})),
    )
    .await;
    let scorer = scorer(&storage);
    let now = noon();

    // denied ip costs 80 on the redeem path
    let outcome = scorer
        .score_redeem_at(business_id, Some(1), Some(42), &ActorContext::with_ip("10.3.3.3"), now)
        .await;
    assert_eq!(outcome.score, 80);
    assert_eq!(outcome.reasons, vec!["ip_deny:+80".to_string()]);
    assert_eq!(outcome.decision, Decision::Block);

    // phone/utm denylists do not apply when redeeming
    let ctx = ctx_with_utm("10.4.4.4", &[("utm_source", "spam-network")]);
    let outcome = scorer
        .score_redeem_at(business_id, Some(1), Some(43), &ctx, now)
        .await;
    assert_eq!(outcome.score, 0);
    assert_eq!(outcome.decision, Decision::Allow);

    let event = storage.get_event(outcome.event_id.unwrap()).await.unwrap();
    assert_eq!(event.kind, RiskKind::Redeem);
    assert_eq!(event.coupon_id, Some(43));
}

#[tokio::test]
async fn redemption_burst_reads_the_scorers_own_audit_trail() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    let scorer = scorer(&storage);
    let now = noon();

    for i in 0..10 {
        storage
            .save_event(&NewRiskEvent {
                business_id,
                kind: RiskKind::Redeem,
                campaign_id: Some(1),
                coupon_id: Some(i),
                phone: String::new(),
                ip: Some("10.5.5.5".to_string()),
                ua: String::new(),
                utm: BTreeMap::new(),
                score: 0,
                reasons: Vec::new(),
                decision: Decision::Allow,
                created_at: now - Duration::minutes(3),
            })
            .await
            .unwrap();
    }

    let outcome = scorer
        .score_redeem_at(business_id, Some(1), Some(99), &ActorContext::with_ip("10.5.5.5"), now)
        .await;
    assert_eq!(outcome.score, 30);
    assert_eq!(outcome.reasons, vec!["redeem_burst_ip_10m:+30 (10)".to_string()]);
    assert_eq!(outcome.decision, Decision::Warn);
}

mockall::mock! {
    Activity {}

    #[async_trait::async_trait]
    impl ActivityStorage for Activity {
        async fn record_issue(&self, record: &NewIssueRecord) -> Result<ModelId>;
        async fn count_issues_from_ip(
            &self,
            business_id: ModelId,
            ip: &str,
            since: DateTime<Utc>,
        ) -> Result<i64>;
        async fn count_issues_for_phone(
            &self,
            business_id: ModelId,
            phone: &str,
            since: DateTime<Utc>,
        ) -> Result<i64>;
        async fn count_distinct_phones_from_ip(
            &self,
            business_id: ModelId,
            ip: &str,
            since: DateTime<Utc>,
        ) -> Result<i64>;
    }
}

#[tokio::test]
async fn counter_failure_fails_closed_to_warn_and_still_audits() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;

    let mut activity = MockActivity::new();
    activity
        .expect_count_issues_from_ip()
        .returning(|_, _, _| Err(EngineError::Database(sqlx::Error::PoolClosed)));
    activity
        .expect_count_issues_for_phone()
        .returning(|_, _, _| Err(EngineError::Database(sqlx::Error::PoolClosed)));
    activity
        .expect_count_distinct_phones_from_ip()
        .returning(|_, _, _| Err(EngineError::Database(sqlx::Error::PoolClosed)));

    let scorer = RiskScorer::new(storage.clone(), Arc::new(activity), storage.clone());
    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("10.6.6.6"), "700", noon())
        .await;

    assert_eq!(outcome.score, 0);
    assert_eq!(outcome.decision, Decision::Warn);
    assert_eq!(outcome.reasons, vec!["counters_unavailable:+0".to_string()]);

    let event = storage.get_event(outcome.event_id.unwrap()).await.unwrap();
    assert_eq!(event.decision, Decision::Warn);
}

#[tokio::test]
async fn add_to_denylist_persists_and_takes_effect() {
    let storage = memory_storage().await;
    let business_id = create_business(&storage, None).await;
    let scorer = scorer(&storage);

    assert!(scorer
        .add_to_denylist(business_id, engine::model::DenyType::Ip, "10.7.7.7")
        .await
        .unwrap());
    // second add is a no-op
    assert!(!scorer
        .add_to_denylist(business_id, engine::model::DenyType::Ip, "10.7.7.7")
        .await
        .unwrap());

    let outcome = scorer
        .score_issue_at(business_id, None, &ActorContext::with_ip("10.7.7.7"), "", noon())
        .await;
    assert_eq!(outcome.reasons, vec!["ip_deny:+100".to_string()]);
    assert_eq!(outcome.decision, Decision::Block);
}
