use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::model::Decision;
use crate::settings::{ActionThresholds, FraudSettings};

/// Redeem-kind events from one ip within 10 minutes before the
/// redemption-burst rule fires.
pub const REDEEM_BURST_PER_IP_10M: i64 = 10;

/// One triggered rule: a reason code, the points it contributes and the
/// observed counter value, when the rule is counter-backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub code: &'static str,
    pub points: i64,
    pub observed: Option<i64>,
}

impl RuleHit {
    pub fn reason(&self) -> String {
        match self.observed {
            Some(count) => format!("{}:+{} ({})", self.code, self.points, count),
            None => format!("{}:+{}", self.code, self.points),
        }
    }
}

pub fn ip_allowed(cfg: &FraudSettings, ip: Option<&str>) -> bool {
    ip.is_some_and(|ip| cfg.ip_allow.iter().any(|allowed| allowed == ip))
}

/// Hard denylist checks on the issue path. The utm check fires at most once
/// even when several utm values match.
pub fn issue_deny_rules(
    cfg: &FraudSettings,
    ip: Option<&str>,
    phone: &str,
    utm: &BTreeMap<String, String>,
) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if let Some(ip) = ip {
        if cfg.ip_deny.iter().any(|denied| denied == ip) {
            hits.push(RuleHit {
                code: "ip_deny",
                points: 100,
                observed: None,
            });
        }
    }
    if !phone.is_empty() && cfg.phone_deny.iter().any(|denied| denied == phone) {
        hits.push(RuleHit {
            code: "phone_deny",
            points: 100,
            observed: None,
        });
    }
    'utm: for value in utm.values() {
        let value = value.to_lowercase();
        for term in &cfg.utm_deny {
            if value.contains(&term.to_lowercase()) {
                hits.push(RuleHit {
                    code: "utm_deny",
                    points: 50,
                    observed: None,
                });
                break 'utm;
            }
        }
    }
    hits
}

pub fn redeem_deny_rule(cfg: &FraudSettings, ip: Option<&str>) -> Option<RuleHit> {
    let ip = ip?;
    cfg.ip_deny.iter().any(|denied| denied == ip).then_some(RuleHit {
        code: "ip_deny",
        points: 80,
        observed: None,
    })
}

/// Issues from one ip in the trailing hour. Strictly above the threshold;
/// the surcharge per excess issue is capped.
pub fn ip_rate_rule(cfg: &FraudSettings, count: i64) -> Option<RuleHit> {
    if count <= cfg.issue_ip_per_hour {
        return None;
    }
    let delta = count - cfg.issue_ip_per_hour;
    Some(RuleHit {
        code: "ip_many_1h",
        points: 10 + (delta * 2).min(40),
        observed: Some(count),
    })
}

/// Issues to one phone in the trailing 24 hours. Fires at the threshold.
pub fn phone_rate_rule(cfg: &FraudSettings, count: i64) -> Option<RuleHit> {
    if count < cfg.phone_per_day {
        return None;
    }
    Some(RuleHit {
        code: "phone_many_24h",
        points: 20 + (count - cfg.phone_per_day) * 10,
        observed: Some(count),
    })
}

/// Distinct phones issued to from one ip in the trailing 10 minutes.
pub fn burst_rule(cfg: &FraudSettings, count: i64) -> Option<RuleHit> {
    if count < cfg.burst_distinct_phones_ip_10m {
        return None;
    }
    Some(RuleHit {
        code: "ip_burst_10m",
        points: 15 + (count - cfg.burst_distinct_phones_ip_10m) * 5,
        observed: Some(count),
    })
}

pub fn redeem_burst_rule(count: i64) -> Option<RuleHit> {
    (count >= REDEEM_BURST_PER_IP_10M).then_some(RuleHit {
        code: "redeem_burst_ip_10m",
        points: 30,
        observed: Some(count),
    })
}

pub fn night_rule(cfg: &FraudSettings, now: DateTime<Utc>) -> Option<RuleHit> {
    cfg.in_night(now).then_some(RuleHit {
        code: "night",
        points: 10,
        observed: None,
    })
}

/// Maps an accumulated score onto a decision tier. Both boundaries are
/// inclusive: a score equal to a threshold lands in the higher tier.
pub fn decide(thresholds: &ActionThresholds, score: i64) -> Decision {
    if score >= thresholds.block {
        Decision::Block
    } else if score >= thresholds.warn {
        Decision::Warn
    } else {
        Decision::Allow
    }
}
