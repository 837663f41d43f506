use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::model::ModelId;
use crate::storage::SegmentStorage;

/// A static promotion suggestion attached to a segment category. A lookup
/// table, not a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromoRecommendation {
    pub discount: String,
    pub duration_days: u32,
    pub cta: String,
    pub notes: String,
    pub recommended_channels: Vec<String>,
    pub timing: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfmAverages {
    pub r: f64,
    pub f: f64,
    pub m: f64,
}

/// Live statistics over a segment's current members plus the promo
/// suggestion for its category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInsights {
    pub size: i64,
    pub avg_rfm: RfmAverages,
    pub avg_recency: f64,
    pub total_ltv: f64,
    pub avg_ltv: f64,
    pub recommendations: PromoRecommendation,
}

fn promo(
    discount: &str,
    duration_days: u32,
    cta: &str,
    notes: &str,
    channels: &[&str],
    timing: &str,
) -> PromoRecommendation {
    PromoRecommendation {
        discount: discount.to_string(),
        duration_days,
        cta: cta.to_string(),
        notes: notes.to_string(),
        recommended_channels: channels.iter().map(|c| c.to_string()).collect(),
        timing: timing.to_string(),
    }
}

/// Keyword-match cascade over the segment name and slug, case-insensitive
/// substring, first matching category wins.
pub fn recommend_promo(name: &str, slug: &str) -> PromoRecommendation {
    let name = name.to_lowercase();
    let slug = slug.to_lowercase();
    let matches = |keywords: &[&str]| {
        keywords
            .iter()
            .any(|kw| name.contains(kw) || slug.contains(kw))
    };

    if matches(&["vip", "premium", "gold", "platinum"]) {
        return promo(
            "15-25%",
            14,
            "A premium offer for our VIPs",
            "Lean on exclusivity and keep the window short. Address the customer personally.",
            &["email", "push"],
            "Best on weekday evenings",
        );
    }
    if matches(&["churn", "risk", "lapsing"]) {
        return promo(
            "10-15%",
            7,
            "Come back, we saved you a deal",
            "Short validity, referral bonus, remind after 2-3 days.",
            &["sms", "email"],
            "Send on weekends for better response",
        );
    }
    if matches(&["new", "welcome"]) {
        return promo(
            "10%",
            14,
            "Welcome! Here is your discount",
            "Sweeten the first redemption with a small gift and show the assortment.",
            &["email", "sms"],
            "Right after sign-up, with a reminder after 3 days",
        );
    }
    if matches(&["active", "frequent", "loyal"]) {
        return promo(
            "12-18%",
            10,
            "Thanks for sticking around!",
            "A loyalty bonus; suggest trying new items.",
            &["push", "email"],
            "Mid-week works best",
        );
    }
    if matches(&["dormant", "sleep", "inactive"]) {
        return promo(
            "8-12%",
            21,
            "We missed you - come see what's new",
            "Long validity, soft tone, show what has changed.",
            &["email"],
            "Start of the month, avoid holidays",
        );
    }
    promo(
        "5-10%",
        10,
        "A deal picked for you",
        "A/B test the headline and CTA. Add a time limit.",
        &["email", "push"],
        "Optimal slots: 10-12 or 16-18",
    )
}

/// Computes [`SegmentInsights`] over current membership rows. Deliberately
/// live (not the cached size): the numbers reflect the store as it is now.
pub struct InsightsService {
    storage: Arc<dyn SegmentStorage>,
}

impl InsightsService {
    pub fn new(storage: Arc<dyn SegmentStorage>) -> Self {
        Self { storage }
    }

    pub async fn segment_insights(&self, segment_id: ModelId) -> Result<SegmentInsights> {
        let segment = self.storage.get_segment(segment_id).await?;
        let recommendations = recommend_promo(&segment.name, &segment.slug);

        let customers = self.storage.member_customers(segment_id).await?;
        if customers.is_empty() {
            return Ok(SegmentInsights {
                size: 0,
                avg_rfm: RfmAverages {
                    r: 0.0,
                    f: 0.0,
                    m: 0.0,
                },
                avg_recency: 0.0,
                total_ltv: 0.0,
                avg_ltv: 0.0,
                recommendations,
            });
        }

        let size = customers.len() as i64;
        let n = customers.len() as f64;
        let avg = |total: f64| round1(total / n);
        let total_ltv: f64 = customers.iter().map(|c| c.redeem_amount_total).sum();

        Ok(SegmentInsights {
            size,
            avg_rfm: RfmAverages {
                r: avg(customers.iter().map(|c| c.r_score as f64).sum()),
                f: avg(customers.iter().map(|c| c.f_score as f64).sum()),
                m: avg(customers.iter().map(|c| c.m_score as f64).sum()),
            },
            avg_recency: avg(customers.iter().map(|c| c.recency_days as f64).sum()),
            total_ltv: round2(total_ltv),
            avg_ltv: round2(total_ltv / n),
            recommendations,
        })
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
