use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::{
    Business, Customer, Decision, EventFilter, EventStats, ModelId, NewCustomer, NewIssueRecord,
    NewRiskEvent, NewSegment, RebuildStats, RiskEvent, RiskKind, Segment, SegmentKind,
};
use crate::segments::compiler::{BindValue, CompiledFilter};
use crate::segments::mask_phone;
use crate::storage::{ActivityStorage, BusinessStorage, RiskEventStorage, SegmentStorage};

/// Membership rows inserted per statement during a rebuild.
pub const MEMBER_INSERT_BATCH: usize = 1000;

/// Customer rows inserted per statement by the bulk import helper.
const CUSTOMER_INSERT_BATCH: usize = 250;

/// Phones cached on the segment row as its preview.
pub const PREVIEW_CACHED: usize = 5;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database exists per connection; a pool larger than
        // one would hand out empty databases.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };
        let pool = options.connect_with(connect).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        let init_sql = include_str!("../../resources/schema.sql");
        sqlx::raw_sql(init_sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_business(&self, name: &str, settings: Option<&Value>) -> Result<ModelId> {
        let settings_json = settings.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO businesses (name, settings, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(settings_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_customer(&self, customer: &NewCustomer) -> Result<ModelId> {
        let result = sqlx::query(
            r#"
            INSERT INTO customers (
                business_id, phone_e164, first_seen, last_issue_at, last_redeem_at,
                issues_count, redeems_count, redeem_amount_total,
                recency_days, r_score, f_score, m_score
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(customer.business_id)
        .bind(&customer.phone_e164)
        .bind(customer.first_seen)
        .bind(customer.last_issue_at)
        .bind(customer.last_redeem_at)
        .bind(customer.issues_count)
        .bind(customer.redeems_count)
        .bind(customer.redeem_amount_total)
        .bind(customer.recency_days)
        .bind(customer.r_score)
        .bind(customer.f_score)
        .bind(customer.m_score)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Batched multi-row insert for backfills and large test fixtures.
    pub async fn insert_customers_bulk(&self, customers: &[NewCustomer]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in customers.chunks(CUSTOMER_INSERT_BATCH) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()];
            let sql = format!(
                r#"
                INSERT INTO customers (
                    business_id, phone_e164, first_seen, last_issue_at, last_redeem_at,
                    issues_count, redeems_count, redeem_amount_total,
                    recency_days, r_score, f_score, m_score
                ) VALUES {}
                "#,
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for customer in chunk {
                query = query
                    .bind(customer.business_id)
                    .bind(&customer.phone_e164)
                    .bind(customer.first_seen)
                    .bind(customer.last_issue_at)
                    .bind(customer.last_redeem_at)
                    .bind(customer.issues_count)
                    .bind(customer.redeems_count)
                    .bind(customer.redeem_amount_total)
                    .bind(customer.recency_days)
                    .bind(customer.r_score)
                    .bind(customer.f_score)
                    .bind(customer.m_score);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn bind_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            BindValue::Int(v) => query.bind(*v),
            BindValue::Float(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.as_str()),
            BindValue::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn decode_json_map(raw: &str) -> Result<BTreeMap<String, String>> {
    Ok(serde_json::from_str(raw)?)
}

fn decode_json_list(raw: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(raw)?)
}

fn event_from_row(row: &SqliteRow) -> Result<RiskEvent> {
    let kind: String = row.try_get("kind")?;
    let decision: String = row.try_get("decision")?;
    let utm: String = row.try_get("utm")?;
    let reasons: String = row.try_get("reasons")?;
    Ok(RiskEvent {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        kind: kind
            .parse::<RiskKind>()
            .map_err(|e| EngineError::Decode(format!("kind '{}': {}", kind, e)))?,
        campaign_id: row.try_get("campaign_id")?,
        coupon_id: row.try_get("coupon_id")?,
        phone: row.try_get("phone")?,
        ip: row.try_get("ip")?,
        ua: row.try_get("ua")?,
        utm: decode_json_map(&utm)?,
        score: row.try_get("score")?,
        reasons: decode_json_list(&reasons)?,
        decision: decision
            .parse::<Decision>()
            .map_err(|e| EngineError::Decode(format!("decision '{}': {}", decision, e)))?,
        resolved: row.try_get("resolved")?,
        created_at: row.try_get("created_at")?,
    })
}

fn segment_from_row(row: &SqliteRow) -> Result<Segment> {
    let kind: String = row.try_get("kind")?;
    let definition: String = row.try_get("definition")?;
    let preview: String = row.try_get("preview")?;
    Ok(Segment {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        kind: kind
            .parse::<SegmentKind>()
            .map_err(|e| EngineError::Decode(format!("segment kind '{}': {}", kind, e)))?,
        definition: serde_json::from_str(&definition)?,
        is_dynamic: row.try_get("is_dynamic")?,
        size_cached: row.try_get("size_cached")?,
        preview: decode_json_list(&preview)?,
        last_built_at: row.try_get("last_built_at")?,
        enabled: row.try_get("enabled")?,
        description: row.try_get("description")?,
        color: row.try_get("color")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn customer_from_row(row: &SqliteRow) -> Result<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        phone_e164: row.try_get("phone_e164")?,
        first_seen: row.try_get("first_seen")?,
        last_issue_at: row.try_get("last_issue_at")?,
        last_redeem_at: row.try_get("last_redeem_at")?,
        issues_count: row.try_get("issues_count")?,
        redeems_count: row.try_get("redeems_count")?,
        redeem_amount_total: row.try_get("redeem_amount_total")?,
        recency_days: row.try_get("recency_days")?,
        r_score: row.try_get("r_score")?,
        f_score: row.try_get("f_score")?,
        m_score: row.try_get("m_score")?,
    })
}

const SEGMENT_COLUMNS: &str = "id, business_id, name, slug, kind, definition, is_dynamic, \
     size_cached, preview, last_built_at, enabled, description, color, created_at, updated_at";

#[async_trait]
impl BusinessStorage for SqliteStorage {
    async fn get_business(&self, id: ModelId) -> Result<Business> {
        let row = sqlx::query("SELECT id, name, settings FROM businesses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("business {}", id)))?;
        let settings: Option<String> = row.try_get("settings")?;
        Ok(Business {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            settings: settings.as_deref().map(serde_json::from_str).transpose()?,
        })
    }

    async fn save_settings(&self, id: ModelId, settings: &Value) -> Result<()> {
        let result = sqlx::query("UPDATE businesses SET settings = ? WHERE id = ?")
            .bind(serde_json::to_string(settings)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("business {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStorage for SqliteStorage {
    async fn record_issue(&self, record: &NewIssueRecord) -> Result<ModelId> {
        let result = sqlx::query(
            r#"
            INSERT INTO coupon_issues (business_id, campaign_id, phone, ip, issued_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.business_id)
        .bind(record.campaign_id)
        .bind(&record.phone)
        .bind(record.ip.as_deref())
        .bind(record.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn count_issues_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_issues WHERE business_id = ? AND ip = ? AND issued_at >= ?",
        )
        .bind(business_id)
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_issues_for_phone(
        &self,
        business_id: ModelId,
        phone: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_issues WHERE business_id = ? AND phone = ? AND issued_at >= ?",
        )
        .bind(business_id)
        .bind(phone)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_distinct_phones_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT phone) FROM coupon_issues
            WHERE business_id = ? AND ip = ? AND issued_at >= ?
            "#,
        )
        .bind(business_id)
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl RiskEventStorage for SqliteStorage {
    async fn save_event(&self, event: &NewRiskEvent) -> Result<ModelId> {
        let result = sqlx::query(
            r#"
            INSERT INTO risk_events (
                business_id, kind, campaign_id, coupon_id, phone, ip, ua, utm,
                score, reasons, decision, resolved, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(event.business_id)
        .bind(event.kind.to_string())
        .bind(event.campaign_id)
        .bind(event.coupon_id)
        .bind(&event.phone)
        .bind(event.ip.as_deref())
        .bind(&event.ua)
        .bind(serde_json::to_string(&event.utm)?)
        .bind(event.score)
        .bind(serde_json::to_string(&event.reasons)?)
        .bind(event.decision.to_string())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        debug!("saved risk event {} for business {}", result.last_insert_rowid(), event.business_id);
        Ok(result.last_insert_rowid())
    }

    async fn get_event(&self, id: ModelId) -> Result<RiskEvent> {
        let row = sqlx::query("SELECT * FROM risk_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("risk event {}", id)))?;
        event_from_row(&row)
    }

    async fn count_redeems_from_ip(
        &self,
        business_id: ModelId,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM risk_events
            WHERE business_id = ? AND kind = ? AND ip = ? AND created_at >= ?
            "#,
        )
        .bind(business_id)
        .bind(RiskKind::Redeem.to_string())
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn recent_events(
        &self,
        business_id: ModelId,
        filter: &EventFilter,
        limit: i64,
    ) -> Result<Vec<RiskEvent>> {
        let mut sql = String::from("SELECT * FROM risk_events WHERE business_id = ?");
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if filter.decision.is_some() {
            sql.push_str(" AND decision = ?");
        }
        if filter.resolved.is_some() {
            sql.push_str(" AND resolved = ?");
        }
        if filter.phone.is_some() {
            sql.push_str(" AND phone LIKE ?");
        }
        if filter.ip.is_some() {
            sql.push_str(" AND ip LIKE ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(business_id);
        if let Some(kind) = filter.kind {
            query = query.bind(kind.to_string());
        }
        if let Some(decision) = filter.decision {
            query = query.bind(decision.to_string());
        }
        if let Some(resolved) = filter.resolved {
            query = query.bind(resolved);
        }
        if let Some(phone) = &filter.phone {
            query = query.bind(format!("%{}%", phone));
        }
        if let Some(ip) = &filter.ip {
            query = query.bind(format!("%{}%", ip));
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn event_stats(&self, business_id: ModelId) -> Result<EventStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN decision = 'block' THEN 1 ELSE 0 END), 0) AS blocks,
                COALESCE(SUM(CASE WHEN decision = 'warn' THEN 1 ELSE 0 END), 0) AS warns,
                COALESCE(SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END), 0) AS unresolved
            FROM risk_events WHERE business_id = ?
            "#,
        )
        .bind(business_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(EventStats {
            total: row.try_get("total")?,
            blocks: row.try_get("blocks")?,
            warns: row.try_get("warns")?,
            unresolved: row.try_get("unresolved")?,
        })
    }

    async fn resolve_event(&self, id: ModelId) -> Result<()> {
        let result = sqlx::query("UPDATE risk_events SET resolved = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("risk event {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SegmentStorage for SqliteStorage {
    async fn get_segment(&self, id: ModelId) -> Result<Segment> {
        let sql = format!("SELECT {} FROM segments WHERE id = ?", SEGMENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("segment {}", id)))?;
        segment_from_row(&row)
    }

    async fn list_enabled_segments(&self, business_id: ModelId) -> Result<Vec<Segment>> {
        let sql = format!(
            "SELECT {} FROM segments WHERE business_id = ? AND enabled = 1 ORDER BY kind, name",
            SEGMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(business_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(segment_from_row).collect()
    }

    async fn get_or_create_segment(&self, segment: &NewSegment) -> Result<(Segment, bool)> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO segments (
                business_id, name, slug, kind, definition, is_dynamic,
                enabled, description, color, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(segment.business_id)
        .bind(&segment.name)
        .bind(&segment.slug)
        .bind(segment.kind.to_string())
        .bind(serde_json::to_string(&segment.definition)?)
        .bind(segment.is_dynamic)
        .bind(segment.enabled)
        .bind(&segment.description)
        .bind(&segment.color)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected() > 0;

        let sql = format!(
            "SELECT {} FROM segments WHERE business_id = ? AND slug = ?",
            SEGMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(segment.business_id)
            .bind(&segment.slug)
            .fetch_one(&self.pool)
            .await?;
        Ok((segment_from_row(&row)?, created))
    }

    async fn replace_membership(
        &self,
        segment: &Segment,
        filter: &CompiledFilter,
        cap: i64,
        now: DateTime<Utc>,
    ) -> Result<RebuildStats> {
        let mut tx = self.pool.begin().await?;

        if segment.is_dynamic {
            sqlx::query("DELETE FROM segment_members WHERE segment_id = ?")
                .bind(segment.id)
                .execute(&mut *tx)
                .await?;
        }

        let select = format!(
            "SELECT id, phone_e164 FROM customers WHERE {} ORDER BY id LIMIT ?",
            filter.where_sql
        );
        let rows = bind_filter(sqlx::query(&select), &filter.binds)
            .bind(cap)
            .fetch_all(&mut *tx)
            .await?;

        let mut matched: Vec<(ModelId, String)> = Vec::with_capacity(rows.len());
        for row in &rows {
            matched.push((row.try_get("id")?, row.try_get("phone_e164")?));
        }

        for chunk in matched.chunks(MEMBER_INSERT_BATCH) {
            let placeholders = vec!["(?, ?, ?)"; chunk.len()];
            let sql = format!(
                "INSERT OR IGNORE INTO segment_members (segment_id, customer_id, added_at) VALUES {}",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for (customer_id, _) in chunk {
                query = query.bind(segment.id).bind(*customer_id).bind(now);
            }
            query.execute(&mut *tx).await?;
        }

        let size = matched.len() as i64;
        let preview: Vec<String> = matched
            .iter()
            .take(PREVIEW_CACHED)
            .map(|(_, phone)| mask_phone(phone))
            .collect();

        sqlx::query(
            r#"
            UPDATE segments
            SET size_cached = ?, preview = ?, last_built_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(size)
        .bind(serde_json::to_string(&preview)?)
        .bind(now)
        .bind(now)
        .bind(segment.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RebuildStats { size, preview })
    }

    async fn select_preview(&self, filter: &CompiledFilter, limit: i64) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT phone_e164 FROM customers WHERE {} ORDER BY id LIMIT ?",
            filter.where_sql
        );
        let rows = bind_filter(sqlx::query(&sql), &filter.binds)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut phones = Vec::with_capacity(rows.len());
        for row in &rows {
            phones.push(row.try_get("phone_e164")?);
        }
        Ok(phones)
    }

    async fn member_customers(&self, segment_id: ModelId) -> Result<Vec<Customer>> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM customers c
            JOIN segment_members m ON m.customer_id = c.id
            WHERE m.segment_id = ?
            ORDER BY c.id
            "#,
        )
        .bind(segment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(customer_from_row).collect()
    }
}
