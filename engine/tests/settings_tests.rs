use serde_json::json;

use engine::model::DenyType;
use engine::settings::{append_deny_entry, FraudSettings};

#[test]
fn resolve_without_settings_returns_documented_defaults() {
    let cfg = FraudSettings::resolve(None);
    assert_eq!(cfg.issue_ip_per_hour, 20);
    assert_eq!(cfg.phone_per_day, 2);
    assert_eq!(cfg.burst_distinct_phones_ip_10m, 5);
    assert_eq!(cfg.night_hours, vec![0, 6]);
    assert!(cfg.utm_deny.is_empty());
    assert!(cfg.ip_deny.is_empty());
    assert!(cfg.phone_deny.is_empty());
    assert!(cfg.ip_allow.is_empty());
    assert_eq!(cfg.action_thresholds.warn, 20);
    assert_eq!(cfg.action_thresholds.block, 50);
}

#[test]
fn resolve_without_fraud_section_returns_defaults() {
    let blob = json!({"contacts": {"email": "owner@example.com"}});
    assert_eq!(FraudSettings::resolve(Some(&blob)), FraudSettings::default());
}

#[test]
fn resolve_merges_overrides_per_key() {
    let blob = json!({
        "fraud": {
            "issue_ip_per_hour": 5,
            "ip_deny": ["10.0.0.1"],
            "night_hours": [22, 6]
        }
    });
    let cfg = FraudSettings::resolve(Some(&blob));
    assert_eq!(cfg.issue_ip_per_hour, 5);
    assert_eq!(cfg.ip_deny, vec!["10.0.0.1".to_string()]);
    assert_eq!(cfg.night_hours, vec![22, 6]);
    // untouched keys keep their defaults
    assert_eq!(cfg.phone_per_day, 2);
    assert_eq!(cfg.action_thresholds.warn, 20);
}

#[test]
fn partial_action_thresholds_backfill_independently() {
    let blob = json!({"fraud": {"action_thresholds": {"block": 30}}});
    let cfg = FraudSettings::resolve(Some(&blob));
    assert_eq!(cfg.action_thresholds.warn, 20);
    assert_eq!(cfg.action_thresholds.block, 30);

    let blob = json!({"fraud": {"action_thresholds": {"warn": 10}}});
    let cfg = FraudSettings::resolve(Some(&blob));
    assert_eq!(cfg.action_thresholds.warn, 10);
    assert_eq!(cfg.action_thresholds.block, 50);
}

#[test]
fn malformed_values_fall_back_to_that_keys_default() {
    let blob = json!({
        "fraud": {
            "issue_ip_per_hour": "lots",
            "ip_deny": "10.0.0.1",
            "action_thresholds": [20, 50]
        }
    });
    let cfg = FraudSettings::resolve(Some(&blob));
    assert_eq!(cfg.issue_ip_per_hour, 20);
    assert!(cfg.ip_deny.is_empty());
    assert_eq!(cfg.action_thresholds.warn, 20);
    assert_eq!(cfg.action_thresholds.block, 50);
}

#[test]
fn empty_night_hours_disable_the_window() {
    let blob = json!({"fraud": {"night_hours": []}});
    let cfg = FraudSettings::resolve(Some(&blob));
    assert!(cfg.night_hours.is_empty());
    assert!(!cfg.in_night(chrono::Utc::now()));
}

#[test]
fn append_deny_entry_builds_structure_and_deduplicates() {
    let mut settings = json!({});
    assert!(append_deny_entry(&mut settings, DenyType::Ip, "10.0.0.1"));
    assert!(append_deny_entry(&mut settings, DenyType::Phone, "77012345678"));
    // duplicate is a no-op
    assert!(!append_deny_entry(&mut settings, DenyType::Ip, "10.0.0.1"));

    assert_eq!(settings["fraud"]["ip_deny"], json!(["10.0.0.1"]));
    assert_eq!(settings["fraud"]["phone_deny"], json!(["77012345678"]));

    // and the resolver sees the appended entries
    let cfg = FraudSettings::resolve(Some(&settings));
    assert_eq!(cfg.ip_deny, vec!["10.0.0.1".to_string()]);
}

#[test]
fn append_deny_entry_preserves_existing_entries() {
    let mut settings = json!({"fraud": {"utm_deny": ["spam"]}});
    assert!(append_deny_entry(&mut settings, DenyType::Utm, "bot"));
    assert_eq!(settings["fraud"]["utm_deny"], json!(["spam", "bot"]));
}
