//! Query-time filter descriptor and date-math resolution.
//!
//! Time bounds are kept as date-math expressions (`now-15m`, `now/d`,
//! `2024-01-01T00:00:00Z||+1h`) and passed to the search backend verbatim.
//! They are only resolved locally when a real-valued range length is needed.

use crate::error::{Result, ServicemapError};
use crate::mode::AnalyticsMode;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Time window in date-math form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Filters applied to every span-level query of one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dsl {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    /// Extra `bool.filter` clauses, passed through unchanged
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl Dsl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.time_range = Some(TimeRange {
            start: start.into(),
            end: end.into(),
        });
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, clause: Value) -> Self {
        self.filters.push(clause);
        self
    }

    /// `bool.filter` clauses for span queries in `mode`.
    pub fn filter_clauses(&self, mode: AnalyticsMode) -> Vec<Value> {
        let fields = mode.fields();
        let mut clauses = Vec::with_capacity(self.filters.len() + 2);
        if let Some(range) = &self.time_range {
            clauses.push(json!({
                "range": {
                    fields.start_time: { "gte": range.start, "lte": range.end }
                }
            }));
        }
        if let Some(name) = &self.service_name {
            clauses.push(json!({ "term": { fields.service: name } }));
        }
        clauses.extend(self.filters.iter().cloned());
        clauses
    }

    /// Length of the time range in minutes, relative to `now`.
    ///
    /// The end bound is resolved rounding up and then ceiled to a whole
    /// minute. Returns `None` without a time range.
    pub fn minutes_in_range(&self, now: DateTime<Utc>) -> Result<Option<f64>> {
        let Some(range) = &self.time_range else {
            return Ok(None);
        };
        let start = parse_date_math(&range.start, now, false)?;
        let end = ceil_to_minute(parse_date_math(&range.end, now, true)?);
        Ok(Some((end - start).num_milliseconds() as f64 / 60_000.0))
    }
}

fn op_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([+-])(\d*)([yMwdhHms])|/([yMwdhHms])").expect("static date-math regex")
    })
}

/// Resolve a date-math expression.
///
/// `round_up` selects the last millisecond of a rounded unit instead of its
/// first, as used for range end bounds.
pub fn parse_date_math(expr: &str, now: DateTime<Utc>, round_up: bool) -> Result<DateTime<Utc>> {
    let expr = expr.trim();
    let (mut time, ops) = if let Some(rest) = expr.strip_prefix("now") {
        (now, rest)
    } else {
        let (anchor, rest) = match expr.find("||") {
            Some(idx) => (&expr[..idx], &expr[idx + 2..]),
            None => (expr, ""),
        };
        (parse_anchor(anchor)?, rest)
    };

    // Every character must be consumed by an operation
    let mut consumed = 0;
    for caps in op_regex().captures_iter(ops) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        if whole.start != consumed {
            break;
        }
        consumed = whole.end;

        if let Some(unit) = caps.get(4) {
            time = round_to_unit(time, unit.as_str(), round_up)?;
            continue;
        }

        let sign = &caps[1];
        let amount: i64 = if caps[2].is_empty() {
            1
        } else {
            caps[2]
                .parse()
                .map_err(|_| invalid(expr, "amount out of range"))?
        };
        let amount = if sign == "-" { -amount } else { amount };
        time = shift(time, amount, &caps[3]).ok_or_else(|| invalid(expr, "date out of range"))?;
    }

    if consumed != ops.len() {
        return Err(invalid(expr, "unrecognized date-math operation"));
    }
    Ok(time)
}

fn invalid(expr: &str, reason: &str) -> ServicemapError {
    ServicemapError::InvalidInput(format!("Invalid date expression '{}': {}", expr, reason))
}

fn parse_anchor(anchor: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(anchor) {
        return Ok(dt.with_timezone(&Utc));
    }
    if !anchor.is_empty() && anchor.chars().all(|c| c.is_ascii_digit()) {
        let millis: i64 = anchor
            .parse()
            .map_err(|_| invalid(anchor, "epoch out of range"))?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| invalid(anchor, "epoch out of range"));
    }
    if let Ok(date) = NaiveDate::parse_from_str(anchor, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(invalid(anchor, "unrecognized timestamp"))
}

fn shift(time: DateTime<Utc>, amount: i64, unit: &str) -> Option<DateTime<Utc>> {
    let months = |n: i64| -> Option<DateTime<Utc>> {
        let m = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
        if n >= 0 {
            time.checked_add_months(m)
        } else {
            time.checked_sub_months(m)
        }
    };
    match unit {
        "y" => months(amount.checked_mul(12)?),
        "M" => months(amount),
        "w" => time.checked_add_signed(Duration::try_weeks(amount)?),
        "d" => time.checked_add_signed(Duration::try_days(amount)?),
        "h" | "H" => time.checked_add_signed(Duration::try_hours(amount)?),
        "m" => time.checked_add_signed(Duration::try_minutes(amount)?),
        "s" => time.checked_add_signed(Duration::try_seconds(amount)?),
        _ => None,
    }
}

fn round_to_unit(time: DateTime<Utc>, unit: &str, round_up: bool) -> Result<DateTime<Utc>> {
    let start = start_of_unit(time, unit).ok_or_else(|| invalid(unit, "cannot round"))?;
    if !round_up {
        return Ok(start);
    }
    let next = shift(start, 1, unit).ok_or_else(|| invalid(unit, "cannot round"))?;
    Ok(next - Duration::milliseconds(1))
}

fn start_of_unit(time: DateTime<Utc>, unit: &str) -> Option<DateTime<Utc>> {
    let date = time.date_naive();
    let naive = match unit {
        "y" => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
        "M" => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_hms_opt(0, 0, 0)?,
        "w" => {
            let offset = i64::from(date.weekday().num_days_from_monday());
            (date - Duration::days(offset)).and_hms_opt(0, 0, 0)?
        }
        "d" => date.and_hms_opt(0, 0, 0)?,
        "h" | "H" => date.and_hms_opt(time.hour(), 0, 0)?,
        "m" => date.and_hms_opt(time.hour(), time.minute(), 0)?,
        "s" => date.and_hms_opt(time.hour(), time.minute(), time.second())?,
        _ => return None,
    };
    Some(Utc.from_utc_datetime(&naive))
}

fn ceil_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    match start_of_unit(time, "m") {
        Some(floor) if floor != time => floor + Duration::minutes(1),
        _ => time,
    }
}
