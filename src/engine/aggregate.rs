//! Aggregator: four bounded, read-only series over the candidate table.
//!
//! Grouping for states and operators happens inside SQLite. Visits are
//! bucketed here because truncating to the hour is not a native grouping key
//! across the date encodings found in real exports.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::config::LimitsConfig;
use crate::core::errors::{EmrtError, Result};
use crate::engine::database::{DatabaseHandle, SqlValue, quote_ident};
use crate::engine::schema::SchemaCandidate;

/// Label for a null or unrepresentable status value.
pub const UNKNOWN_STATE: &str = "UNKNOWN";
/// Label for a null or unrepresentable operator value.
pub const SYSTEM_OPERATOR: &str = "SYSTEM";

/// Epoch values above this are milliseconds.
pub const EPOCH_MILLIS_FLOOR: f64 = 1e12;
/// Epoch values above this (and not millis) are seconds.
const EPOCH_SECONDS_FLOOR: f64 = 1e9;
const SECONDS_PER_HOUR: i64 = 3600;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d"];

/// Aggregate row caps, taken from `[limits]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateLimits {
    pub visit_scan_rows: usize,
    pub visit_buckets: usize,
    pub group_limit: usize,
    pub duration_samples: usize,
}

impl Default for AggregateLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for AggregateLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            visit_scan_rows: cfg.visit_scan_rows,
            visit_buckets: cfg.visit_buckets,
            group_limit: cfg.group_limit,
            duration_samples: cfg.duration_samples,
        }
    }
}

/// Visit count for one hour, `date` is the ISO-8601 UTC top of the hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitBucket {
    pub date: String,
    pub value: u64,
}

/// One raw duration sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSample {
    pub index: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorCount {
    pub name: String,
    pub value: u64,
}

/// The only artifact that crosses the worker boundary: counts and groupings,
/// never rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub visits: Vec<VisitBucket>,
    pub duration: Vec<DurationSample>,
    pub states: Vec<CategoryCount>,
    pub operators: Vec<OperatorCount>,
    /// Reserved; real exports never populate it.
    pub volume: Vec<VisitBucket>,
}

impl AggregateResult {
    /// True when every series respects `limits`.
    #[must_use]
    pub fn is_within(&self, limits: &AggregateLimits) -> bool {
        self.visits.len() <= limits.visit_buckets
            && self.duration.len() <= limits.duration_samples
            && self.states.len() <= limits.group_limit
            && self.operators.len() <= limits.group_limit
    }

    /// SHA-256 hex digest of the canonical JSON encoding.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Run all four series for `candidate`. Absent roles yield empty series.
pub fn aggregate(
    handle: &dyn DatabaseHandle,
    candidate: &SchemaCandidate,
    limits: &AggregateLimits,
) -> Result<AggregateResult> {
    let table = candidate.table.as_str();
    let roles = &candidate.roles;

    let visits = match roles.time.as_deref() {
        Some(col) => visits_by_hour(handle, table, col, limits)?,
        None => Vec::new(),
    };
    let duration = match roles.duration.as_deref() {
        Some(col) => duration_samples(handle, table, col, limits.duration_samples)?,
        None => Vec::new(),
    };
    let states = match roles.status.as_deref() {
        Some(col) => group_counts(handle, table, col, limits.group_limit, UNKNOWN_STATE)?
            .into_iter()
            .map(|(category, value)| CategoryCount { category, value })
            .collect(),
        None => Vec::new(),
    };
    let operators = match roles.operator.as_deref() {
        Some(col) => group_counts(handle, table, col, limits.group_limit, SYSTEM_OPERATOR)?
            .into_iter()
            .map(|(name, value)| OperatorCount { name, value })
            .collect(),
        None => Vec::new(),
    };

    Ok(AggregateResult {
        visits,
        duration,
        states,
        operators,
        volume: Vec::new(),
    })
}

/// Hourly visit counts over the first `visit_scan_rows` rows by time ascending.
pub fn visits_by_hour(
    handle: &dyn DatabaseHandle,
    table: &str,
    column: &str,
    limits: &AggregateLimits,
) -> Result<Vec<VisitBucket>> {
    let col = quote_ident(column);
    let sql = format!(
        "SELECT {col} FROM {} ORDER BY {col} ASC LIMIT ?1",
        quote_ident(table)
    );
    let rows = handle.query(&sql, &[limit_param(limits.visit_scan_rows)?])?;
    let stamps = rows
        .iter()
        .filter_map(|row| row.first())
        .filter_map(parse_timestamp);
    Ok(bucket_by_hour(stamps, limits.visit_buckets))
}

/// Up to `limit` numeric duration values in source row order.
pub fn duration_samples(
    handle: &dyn DatabaseHandle,
    table: &str,
    column: &str,
    limit: usize,
) -> Result<Vec<DurationSample>> {
    let col = quote_ident(column);
    let sql = format!(
        "SELECT {col} FROM {} WHERE typeof({col}) IN ('integer', 'real') LIMIT ?1",
        quote_ident(table)
    );
    let rows = handle.query(&sql, &[limit_param(limit)?])?;
    let samples = rows
        .iter()
        .filter_map(|row| match row.first() {
            Some(SqlValue::Integer(n)) => Some(*n as f64),
            Some(SqlValue::Real(f)) => Some(*f),
            _ => None,
        })
        .enumerate()
        .map(|(index, value)| DurationSample { index, value })
        .collect();
    Ok(samples)
}

/// Counts per label, descending, capped at `limit` groups.
///
/// Labels are assigned inside SQLite before grouping: text is kept as is,
/// numbers render as text (so `1` and `'1'` share a group), and null, blank or
/// blob values take `fallback_label`. The cap therefore applies to merged
/// groups. Ties order real values before the fallback, then by label.
pub fn group_counts(
    handle: &dyn DatabaseHandle,
    table: &str,
    column: &str,
    limit: usize,
    fallback_label: &str,
) -> Result<Vec<(String, u64)>> {
    let col = quote_ident(column);
    let sql = format!(
        "SELECT COALESCE(raw, ?2) AS label, COUNT(*) AS n, MIN(raw IS NULL) AS fallback \
         FROM (SELECT CASE \
                 WHEN typeof({col}) = 'text' AND trim({col}) <> '' THEN {col} \
                 WHEN typeof({col}) IN ('integer', 'real') THEN CAST({col} AS TEXT) \
               END AS raw FROM {}) \
         GROUP BY label ORDER BY n DESC, fallback ASC, label ASC LIMIT ?1",
        quote_ident(table)
    );
    let rows = handle.query(
        &sql,
        &[
            limit_param(limit)?,
            SqlValue::Text(fallback_label.to_string()),
        ],
    )?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let mut cells = row.into_iter();
            let label = match cells.next() {
                Some(SqlValue::Text(label)) => label,
                _ => return None,
            };
            let count = match cells.next() {
                Some(SqlValue::Integer(n)) => u64::try_from(n).unwrap_or(0),
                _ => 0,
            };
            Some((label, count))
        })
        .collect())
}

fn limit_param(limit: usize) -> Result<SqlValue> {
    i64::try_from(limit)
        .map(SqlValue::Integer)
        .map_err(|_| EmrtError::Runtime {
            details: format!("row limit {limit} out of range"),
        })
}

/// Group timestamps into hourly counts and keep the most recent `keep` buckets.
pub fn bucket_by_hour<I>(stamps: I, keep: usize) -> Vec<VisitBucket>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for ts in stamps {
        *counts.entry(hour_key(&ts)).or_insert(0) += 1;
    }
    let skip = counts.len().saturating_sub(keep);
    counts
        .into_iter()
        .skip(skip)
        .filter_map(|(key, value)| {
            DateTime::<Utc>::from_timestamp(key, 0).map(|hour| VisitBucket {
                date: hour.to_rfc3339_opts(SecondsFormat::Millis, true),
                value,
            })
        })
        .collect()
}

/// Seconds since epoch of the top of the hour containing `ts`.
#[must_use]
pub fn hour_key(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(SECONDS_PER_HOUR) * SECONDS_PER_HOUR
}

/// Interpret a stored value as a point in time.
///
/// Numbers above 1e12 are epoch milliseconds, above 1e9 epoch seconds; smaller
/// numbers and text go through the date parsers. Naive values are taken as UTC.
#[must_use]
pub fn parse_timestamp(value: &SqlValue) -> Option<DateTime<Utc>> {
    match value {
        SqlValue::Integer(n) => from_epoch_number(*n as f64),
        SqlValue::Real(f) => from_epoch_number(*f),
        SqlValue::Text(text) => parse_text_timestamp(text),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

fn from_epoch_number(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() {
        return None;
    }
    if n > EPOCH_MILLIS_FLOOR {
        DateTime::from_timestamp_millis(n as i64)
    } else if n > EPOCH_SECONDS_FLOOR {
        DateTime::from_timestamp_millis((n * 1000.0) as i64)
    } else if n.fract() == 0.0 && n >= 0.0 {
        parse_date_formats(&format!("{}", n as i64))
    } else {
        None
    }
}

/// Parse a text timestamp: numeric text follows the epoch rules.
#[must_use]
pub fn parse_text_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return from_epoch_number(n);
    }
    parse_date_formats(trimmed)
}

fn parse_date_formats(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}
