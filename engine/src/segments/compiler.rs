use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;

use crate::model::ModelId;

/// Customer fields a segment condition may reference. The `*_days_ago`
/// entries are computed fields backed by a date column; comparing against
/// them inverts the comparison direction (see [`Condition::to_sql`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentField {
    RecencyDays,
    IssuesCount,
    RedeemsCount,
    RScore,
    FScore,
    MScore,
    RedeemAmountTotal,
    FirstSeenDaysAgo,
    LastIssueDaysAgo,
    LastRedeemDaysAgo,
}

impl SegmentField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "recency_days" => Some(Self::RecencyDays),
            "issues_count" => Some(Self::IssuesCount),
            "redeems_count" => Some(Self::RedeemsCount),
            "r_score" => Some(Self::RScore),
            "f_score" => Some(Self::FScore),
            "m_score" => Some(Self::MScore),
            "redeem_amount_total" => Some(Self::RedeemAmountTotal),
            "first_seen_days_ago" => Some(Self::FirstSeenDaysAgo),
            "last_issue_days_ago" => Some(Self::LastIssueDaysAgo),
            "last_redeem_days_ago" => Some(Self::LastRedeemDaysAgo),
            _ => None,
        }
    }

    /// Underlying column on the customers table.
    fn column(&self) -> &'static str {
        match self {
            Self::RecencyDays => "recency_days",
            Self::IssuesCount => "issues_count",
            Self::RedeemsCount => "redeems_count",
            Self::RScore => "r_score",
            Self::FScore => "f_score",
            Self::MScore => "m_score",
            Self::RedeemAmountTotal => "redeem_amount_total",
            Self::FirstSeenDaysAgo => "first_seen",
            Self::LastIssueDaysAgo => "last_issue_at",
            Self::LastRedeemDaysAgo => "last_redeem_at",
        }
    }

    fn is_days_ago(&self) -> bool {
        matches!(
            self,
            Self::FirstSeenDaysAgo | Self::LastIssueDaysAgo | Self::LastRedeemDaysAgo
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Lte,
    Gte,
    Eq,
    Gt,
    Lt,
    Between,
}

impl CondOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<=" => Some(Self::Lte),
            ">=" => Some(Self::Gte),
            "=" => Some(Self::Eq),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            "between" => Some(Self::Between),
            _ => None,
        }
    }

    fn to_sql(&self) -> &'static str {
        match self {
            Self::Lte => "<=",
            Self::Gte => ">=",
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Between => "BETWEEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CondValue {
    Number(f64),
    Range(f64, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: SegmentField,
    pub op: CondOp,
    pub value: CondValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    All,
    Any,
}

/// Value bound into the generated SQL, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// A `WHERE` clause over the customers table plus its bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub where_sql: String,
    pub binds: Vec<BindValue>,
}

/// A validated-enough condition tree, always scoped to one business.
/// Compilation is lenient: unknown fields/operators and malformed values are
/// skipped with a warning so a stored definition can never break a rebuild.
/// Use [`validate_definition`] for the strict, user-facing check.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFilter {
    pub business_id: ModelId,
    pub logic: Logic,
    pub conds: Vec<Condition>,
}

impl SegmentFilter {
    pub fn compile(business_id: ModelId, definition: &Value) -> Self {
        let logic = match definition.get("logic").and_then(Value::as_str) {
            Some("any") => Logic::Any,
            _ => Logic::All,
        };

        let mut conds = Vec::new();
        if let Some(raw_conds) = definition.get("conds").and_then(Value::as_array) {
            for raw in raw_conds {
                if let Some(cond) = Self::parse_condition(raw) {
                    conds.push(cond);
                }
            }
        }

        Self {
            business_id,
            logic,
            conds,
        }
    }

    fn parse_condition(raw: &Value) -> Option<Condition> {
        let field_name = raw.get("field").and_then(Value::as_str)?;
        let Some(field) = SegmentField::parse(field_name) else {
            warn!("unknown field in condition: {}", field_name);
            return None;
        };
        let op_name = raw.get("op").and_then(Value::as_str)?;
        let Some(op) = CondOp::parse(op_name) else {
            warn!("unknown operator in condition: {}", op_name);
            return None;
        };
        let raw_value = raw.get("value")?;

        let value = if op == CondOp::Between {
            if field.is_days_ago() {
                warn!("'between' is not supported on {}", field_name);
                return None;
            }
            let pair = raw_value.as_array()?;
            if pair.len() != 2 {
                warn!("malformed 'between' value for {}", field_name);
                return None;
            }
            CondValue::Range(pair[0].as_f64()?, pair[1].as_f64()?)
        } else {
            match raw_value.as_f64() {
                Some(n) => CondValue::Number(n),
                None => {
                    warn!("non-numeric value for {}", field_name);
                    return None;
                }
            }
        };

        Some(Condition { field, op, value })
    }

    /// Renders the filter to SQL. `now` anchors the `*_days_ago` cutoffs so
    /// the same filter compiles identically within one rebuild.
    pub fn to_sql(&self, now: DateTime<Utc>) -> CompiledFilter {
        let mut where_sql = String::from("business_id = ?");
        let mut binds = vec![BindValue::Int(self.business_id)];

        if self.conds.is_empty() {
            return CompiledFilter { where_sql, binds };
        }

        let mut parts = Vec::with_capacity(self.conds.len());
        for cond in &self.conds {
            let (sql, mut values) = cond.to_sql(now);
            parts.push(sql);
            binds.append(&mut values);
        }
        let joiner = match self.logic {
            Logic::All => " AND ",
            Logic::Any => " OR ",
        };
        where_sql.push_str(" AND (");
        where_sql.push_str(&parts.join(joiner));
        where_sql.push(')');

        CompiledFilter { where_sql, binds }
    }
}

impl Condition {
    /// "N days ago" comparisons translate to the underlying date column with
    /// the direction inverted: a smaller days-ago value means a *more recent*
    /// timestamp, so `<= N days ago` becomes `column >= now - N days`.
    fn to_sql(&self, now: DateTime<Utc>) -> (String, Vec<BindValue>) {
        let column = self.field.column();

        if self.field.is_days_ago() {
            let days = match self.value {
                CondValue::Number(n) => n as i64,
                // filtered out at parse time
                CondValue::Range(..) => return ("0 = 1".to_string(), Vec::new()),
            };
            let cutoff = now - Duration::days(days);
            let sql = match self.op {
                CondOp::Lte => format!("{} >= ?", column),
                CondOp::Gte => format!("{} <= ?", column),
                CondOp::Gt => format!("{} < ?", column),
                CondOp::Lt => format!("{} > ?", column),
                CondOp::Eq => format!("date({}) = date(?)", column),
                // filtered out at parse time
                CondOp::Between => return ("0 = 1".to_string(), Vec::new()),
            };
            return (sql, vec![BindValue::Timestamp(cutoff)]);
        }

        match self.value {
            CondValue::Number(n) => (
                format!("{} {} ?", column, self.op.to_sql()),
                vec![BindValue::Float(n)],
            ),
            CondValue::Range(low, high) => (
                format!("{} BETWEEN ? AND ?", column),
                vec![BindValue::Float(low), BindValue::Float(high)],
            ),
        }
    }
}

/// Strict validation of a user-supplied definition, returning a distinct
/// human-readable message per failure mode. Mirrors what [`SegmentFilter::compile`]
/// accepts, except that validation rejects what compilation would skip.
pub fn validate_definition(definition: &Value) -> Result<(), String> {
    let Some(root) = definition.as_object() else {
        return Err("definition must be a JSON object".to_string());
    };

    if let Some(logic) = root.get("logic") {
        match logic.as_str() {
            Some("all") | Some("any") => {}
            _ => return Err("logic must be 'all' or 'any'".to_string()),
        }
    }

    let conds = match root.get("conds") {
        None => return Ok(()),
        Some(conds) => conds
            .as_array()
            .ok_or_else(|| "conds must be an array".to_string())?,
    };

    for (i, cond) in conds.iter().enumerate() {
        let n = i + 1;
        let Some(cond) = cond.as_object() else {
            return Err(format!("condition {}: must be an object", n));
        };

        let field = cond
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("condition {}: missing 'field'", n))?;
        if SegmentField::parse(field).is_none() {
            return Err(format!("condition {}: unknown field '{}'", n, field));
        }

        let op = cond
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("condition {}: missing 'op'", n))?;
        let Some(op) = CondOp::parse(op) else {
            return Err(format!("condition {}: unknown operator '{}'", n, op));
        };

        let value = cond
            .get("value")
            .filter(|v| !v.is_null())
            .ok_or_else(|| format!("condition {}: missing 'value'", n))?;

        if op == CondOp::Between {
            let ok = value.as_array().map(Vec::len) == Some(2);
            if !ok {
                return Err(format!(
                    "condition {}: 'between' requires a two-element array",
                    n
                ));
            }
        }
    }

    Ok(())
}
