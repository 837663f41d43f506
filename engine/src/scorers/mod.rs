use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::ActorContext;
use crate::error::Result;
use crate::model::{Decision, DenyType, ModelId, NewRiskEvent, RiskKind};
use crate::settings::{append_deny_entry, FraudSettings};
use crate::storage::{ActivityStorage, BusinessStorage, RiskEventStorage};

pub mod rules;

use rules::RuleHit;

/// What one scoring call produced. `event_id` is the persisted audit row;
/// it is `None` only when the insert itself failed (logged, never raised).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskOutcome {
    pub score: i64,
    pub reasons: Vec<String>,
    pub decision: Decision,
    pub event_id: Option<ModelId>,
}

/// The fraud scoring engine. Gathers windowed counters from storage, runs
/// the ordered rule set, maps the score onto a decision and persists one
/// audit event per call, allowlisted calls included.
///
/// Scoring never fails visibly: storage errors degrade the outcome (see
/// the counter handling below) instead of propagating to the caller.
pub struct RiskScorer {
    businesses: Arc<dyn BusinessStorage>,
    activity: Arc<dyn ActivityStorage>,
    events: Arc<dyn RiskEventStorage>,
}

impl RiskScorer {
    pub fn new(
        businesses: Arc<dyn BusinessStorage>,
        activity: Arc<dyn ActivityStorage>,
        events: Arc<dyn RiskEventStorage>,
    ) -> Self {
        Self {
            businesses,
            activity,
            events,
        }
    }

    pub async fn score_issue(
        &self,
        business_id: ModelId,
        campaign_id: Option<ModelId>,
        ctx: &ActorContext,
        phone: &str,
    ) -> RiskOutcome {
        self.score_issue_at(business_id, campaign_id, ctx, phone, Utc::now())
            .await
    }

    /// Issue-path scoring anchored at `now`. The score is a monotone
    /// accumulator: every applicable rule runs even after the total has
    /// passed the block threshold. The allowlist is the single short-circuit.
    pub async fn score_issue_at(
        &self,
        business_id: ModelId,
        campaign_id: Option<ModelId>,
        ctx: &ActorContext,
        phone: &str,
        now: DateTime<Utc>,
    ) -> RiskOutcome {
        let cfg = self.load_settings(business_id).await;
        let ip = ctx.ip.as_deref();

        if rules::ip_allowed(&cfg, ip) {
            debug!("ip {:?} allowlisted for business {}", ip, business_id);
            return self
                .finish(
                    business_id,
                    RiskKind::Issue,
                    campaign_id,
                    None,
                    ctx,
                    phone,
                    0,
                    vec!["ip_allow:0".to_string()],
                    Decision::Allow,
                    now,
                )
                .await;
        }

        let mut score = 0;
        let mut reasons = Vec::new();
        let mut degraded = false;
        let apply = |hit: RuleHit, score: &mut i64, reasons: &mut Vec<String>| {
            *score += hit.points;
            reasons.push(hit.reason());
        };

        for hit in rules::issue_deny_rules(&cfg, ip, phone, &ctx.utm) {
            apply(hit, &mut score, &mut reasons);
        }

        if let Some(ip) = ip {
            match self
                .activity
                .count_issues_from_ip(business_id, ip, now - Duration::hours(1))
                .await
            {
                Ok(count) => {
                    if let Some(hit) = rules::ip_rate_rule(&cfg, count) {
                        apply(hit, &mut score, &mut reasons);
                    }
                }
                Err(e) => {
                    error!("ip issue counter failed for business {}: {}", business_id, e);
                    degraded = true;
                }
            }
        }

        if !phone.is_empty() {
            match self
                .activity
                .count_issues_for_phone(business_id, phone, now - Duration::hours(24))
                .await
            {
                Ok(count) => {
                    if let Some(hit) = rules::phone_rate_rule(&cfg, count) {
                        apply(hit, &mut score, &mut reasons);
                    }
                }
                Err(e) => {
                    error!("phone issue counter failed for business {}: {}", business_id, e);
                    degraded = true;
                }
            }
        }

        if let Some(ip) = ip {
            match self
                .activity
                .count_distinct_phones_from_ip(business_id, ip, now - Duration::minutes(10))
                .await
            {
                Ok(count) => {
                    if let Some(hit) = rules::burst_rule(&cfg, count) {
                        apply(hit, &mut score, &mut reasons);
                    }
                }
                Err(e) => {
                    error!("phone burst counter failed for business {}: {}", business_id, e);
                    degraded = true;
                }
            }
        }

        if let Some(hit) = rules::night_rule(&cfg, now) {
            apply(hit, &mut score, &mut reasons);
        }

        let decision = self.decide_with_degradation(&cfg, score, degraded, &mut reasons);
        self.finish(
            business_id,
            RiskKind::Issue,
            campaign_id,
            None,
            ctx,
            phone,
            score,
            reasons,
            decision,
            now,
        )
        .await
    }

    pub async fn score_redeem(
        &self,
        business_id: ModelId,
        campaign_id: Option<ModelId>,
        coupon_id: Option<ModelId>,
        ctx: &ActorContext,
    ) -> RiskOutcome {
        self.score_redeem_at(business_id, campaign_id, coupon_id, ctx, Utc::now())
            .await
    }

    /// Redeem-path scoring: the reduced rule set (ip denylist only, plus the
    /// redemption-burst counter fed by this scorer's own audit trail).
    pub async fn score_redeem_at(
        &self,
        business_id: ModelId,
        campaign_id: Option<ModelId>,
        coupon_id: Option<ModelId>,
        ctx: &ActorContext,
        now: DateTime<Utc>,
    ) -> RiskOutcome {
        let cfg = self.load_settings(business_id).await;
        let ip = ctx.ip.as_deref();

        if rules::ip_allowed(&cfg, ip) {
            debug!("ip {:?} allowlisted for business {}", ip, business_id);
            return self
                .finish(
                    business_id,
                    RiskKind::Redeem,
                    campaign_id,
                    coupon_id,
                    ctx,
                    "",
                    0,
                    vec!["ip_allow:0".to_string()],
                    Decision::Allow,
                    now,
                )
                .await;
        }

        let mut score = 0;
        let mut reasons = Vec::new();
        let mut degraded = false;

        if let Some(hit) = rules::redeem_deny_rule(&cfg, ip) {
            score += hit.points;
            reasons.push(hit.reason());
        }

        if let Some(ip) = ip {
            match self
                .events
                .count_redeems_from_ip(business_id, ip, now - Duration::minutes(10))
                .await
            {
                Ok(count) => {
                    if let Some(hit) = rules::redeem_burst_rule(count) {
                        score += hit.points;
                        reasons.push(hit.reason());
                    }
                }
                Err(e) => {
                    error!("redeem burst counter failed for business {}: {}", business_id, e);
                    degraded = true;
                }
            }
        }

        if let Some(hit) = rules::night_rule(&cfg, now) {
            score += hit.points;
            reasons.push(hit.reason());
        }

        let decision = self.decide_with_degradation(&cfg, score, degraded, &mut reasons);
        self.finish(
            business_id,
            RiskKind::Redeem,
            campaign_id,
            coupon_id,
            ctx,
            "",
            score,
            reasons,
            decision,
            now,
        )
        .await
    }

    /// Appends a value to `fraud.{type}_deny` in the business settings.
    /// Returns whether the value was newly added.
    pub async fn add_to_denylist(
        &self,
        business_id: ModelId,
        deny_type: DenyType,
        value: &str,
    ) -> Result<bool> {
        let business = self.businesses.get_business(business_id).await?;
        let mut settings = business
            .settings
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let added = append_deny_entry(&mut settings, deny_type, value);
        if added {
            self.businesses.save_settings(business_id, &settings).await?;
            info!(
                "added {}='{}' to denylist for business {}",
                deny_type, value, business_id
            );
        }
        Ok(added)
    }

    async fn load_settings(&self, business_id: ModelId) -> FraudSettings {
        match self.businesses.get_business(business_id).await {
            Ok(business) => FraudSettings::resolve(business.settings.as_ref()),
            Err(e) => {
                warn!(
                    "falling back to default fraud settings for business {}: {}",
                    business_id, e
                );
                FraudSettings::default()
            }
        }
    }

    /// A counter that could not be read fails closed: the outcome is raised
    /// to warn instead of silently allowing with an under-counted score.
    fn decide_with_degradation(
        &self,
        cfg: &FraudSettings,
        score: i64,
        degraded: bool,
        reasons: &mut Vec<String>,
    ) -> Decision {
        let decision = rules::decide(&cfg.action_thresholds, score);
        if degraded && decision == Decision::Allow {
            reasons.push("counters_unavailable:+0".to_string());
            return Decision::Warn;
        }
        decision
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        business_id: ModelId,
        kind: RiskKind,
        campaign_id: Option<ModelId>,
        coupon_id: Option<ModelId>,
        ctx: &ActorContext,
        phone: &str,
        score: i64,
        reasons: Vec<String>,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> RiskOutcome {
        let event = NewRiskEvent {
            business_id,
            kind,
            campaign_id,
            coupon_id,
            phone: phone.to_string(),
            ip: ctx.ip.clone(),
            ua: ctx.user_agent.clone(),
            utm: ctx.utm.clone(),
            score,
            reasons: reasons.clone(),
            decision,
            created_at: now,
        };
        let event_id = match self.events.save_event(&event).await {
            Ok(id) => Some(id),
            Err(e) => {
                // the audit insert must not block the business action
                error!("failed to persist risk event for business {}: {}", business_id, e);
                None
            }
        };
        RiskOutcome {
            score,
            reasons,
            decision,
            event_id,
        }
    }
}
