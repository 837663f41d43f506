use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::DenyType;

/// Per-business anti-fraud thresholds and lists, resolved from the
/// business settings blob under the `fraud` key. Every field falls back to
/// its default independently; resolution never fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudSettings {
    pub issue_ip_per_hour: i64,
    pub phone_per_day: i64,
    pub burst_distinct_phones_ip_10m: i64,
    pub night_hours: Vec<i64>,
    pub utm_deny: Vec<String>,
    pub ip_deny: Vec<String>,
    pub phone_deny: Vec<String>,
    pub ip_allow: Vec<String>,
    pub action_thresholds: ActionThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionThresholds {
    pub warn: i64,
    pub block: i64,
}

impl Default for ActionThresholds {
    fn default() -> Self {
        Self { warn: 20, block: 50 }
    }
}

impl Default for FraudSettings {
    fn default() -> Self {
        Self {
            issue_ip_per_hour: 20,
            phone_per_day: 2,
            burst_distinct_phones_ip_10m: 5,
            night_hours: vec![0, 6],
            utm_deny: Vec::new(),
            ip_deny: Vec::new(),
            phone_deny: Vec::new(),
            ip_allow: Vec::new(),
            action_thresholds: ActionThresholds::default(),
        }
    }
}

impl FraudSettings {
    /// Merges the business override onto the defaults. The blob is the whole
    /// business settings object; only its `fraud` sub-object is consulted.
    /// `action_thresholds` is deep-merged so a partial override such as
    /// `{"block": 30}` still yields the default warn threshold.
    pub fn resolve(settings: Option<&Value>) -> Self {
        let mut resolved = Self::default();
        let Some(fraud) = settings
            .and_then(|blob| blob.get("fraud"))
            .and_then(Value::as_object)
        else {
            return resolved;
        };

        if let Some(v) = fraud.get("issue_ip_per_hour").and_then(Value::as_i64) {
            resolved.issue_ip_per_hour = v;
        }
        if let Some(v) = fraud.get("phone_per_day").and_then(Value::as_i64) {
            resolved.phone_per_day = v;
        }
        if let Some(v) = fraud
            .get("burst_distinct_phones_ip_10m")
            .and_then(Value::as_i64)
        {
            resolved.burst_distinct_phones_ip_10m = v;
        }
        if let Some(hours) = fraud.get("night_hours").and_then(Value::as_array) {
            resolved.night_hours = hours.iter().filter_map(Value::as_i64).collect();
        }
        for (key, target) in [
            ("utm_deny", &mut resolved.utm_deny),
            ("ip_deny", &mut resolved.ip_deny),
            ("phone_deny", &mut resolved.phone_deny),
            ("ip_allow", &mut resolved.ip_allow),
        ] {
            if let Some(list) = fraud.get(key).and_then(Value::as_array) {
                *target = list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
        }
        if let Some(thresholds) = fraud.get("action_thresholds").and_then(Value::as_object) {
            if let Some(v) = thresholds.get("warn").and_then(Value::as_i64) {
                resolved.action_thresholds.warn = v;
            }
            if let Some(v) = thresholds.get("block").and_then(Value::as_i64) {
                resolved.action_thresholds.block = v;
            }
        }

        resolved
    }

    /// Whether `now` falls inside the configured night window. The window
    /// may wrap around midnight ([22, 6]); fewer than two bounds disables it.
    pub fn in_night(&self, now: DateTime<Utc>) -> bool {
        if self.night_hours.len() < 2 {
            return false;
        }
        let (start, end) = (self.night_hours[0], self.night_hours[1]);
        let hour = i64::from(now.hour());
        if start <= end {
            start <= hour && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

/// Appends `value` to `fraud.{type}_deny` inside a business settings blob.
/// Returns false (and leaves the blob untouched) when the value is already
/// listed. Missing intermediate objects are created in place.
pub fn append_deny_entry(settings: &mut Value, deny_type: DenyType, value: &str) -> bool {
    if !settings.is_object() {
        *settings = Value::Object(serde_json::Map::new());
    }
    let root = settings.as_object_mut().expect("settings forced to object");
    let fraud = root
        .entry("fraud")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !fraud.is_object() {
        *fraud = Value::Object(serde_json::Map::new());
    }
    let list = fraud
        .as_object_mut()
        .expect("fraud forced to object")
        .entry(deny_type.settings_key())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !list.is_array() {
        *list = Value::Array(Vec::new());
    }
    let entries = list.as_array_mut().expect("deny list forced to array");
    if entries.iter().any(|v| v.as_str() == Some(value)) {
        return false;
    }
    entries.push(Value::String(value.to_string()));
    true
}
