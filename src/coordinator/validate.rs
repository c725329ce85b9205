//! Payload validation and normalization.
//!
//! The engine's output is untrusted until it passes here. Only the `visits`
//! series is mandatory (it may be empty); every other series defaults to
//! empty when missing or malformed.
//!
//! Visit dates are normalized to `DateTime<Utc>`. A date that cannot be parsed
//! is replaced by the caller-supplied `now` so the series keeps its length;
//! each substitution is counted in [`Dashboard::coerced_dates`] so the lossy
//! fallback stays visible.

#![allow(missing_docs)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::errors::{EmrtError, Result};
use crate::engine::aggregate::{
    CategoryCount, DurationSample, EPOCH_MILLIS_FLOOR, OperatorCount, parse_text_timestamp,
};

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Validation {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn fail(reason: &str) -> Self {
        Self {
            ok: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Check the payload contract without transforming anything.
#[must_use]
pub fn validate(payload: Option<&Value>) -> Validation {
    let Some(payload) = payload else {
        return Validation::fail("payload missing");
    };
    let Some(object) = payload.as_object() else {
        return Validation::fail("payload is not an object");
    };
    match object.get("visits") {
        Some(Value::Array(_)) => Validation::pass(),
        Some(_) => Validation::fail("visits is not a sequence"),
        None => Validation::fail("visits missing"),
    }
}

/// One normalized point of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitPoint {
    #[serde(with = "rfc3339_millis")]
    pub date: DateTime<Utc>,
    pub value: u64,
}

/// Validated, normalized result ready for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub visits: Vec<VisitPoint>,
    pub duration: Vec<DurationSample>,
    pub states: Vec<CategoryCount>,
    pub operators: Vec<OperatorCount>,
    pub volume: Vec<VisitPoint>,
    /// Dates replaced by the fallback timestamp.
    pub coerced_dates: usize,
}

impl Dashboard {
    /// True when no series has data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
            && self.duration.is_empty()
            && self.states.is_empty()
            && self.operators.is_empty()
            && self.volume.is_empty()
    }
}

/// Validate and normalize, substituting the current time for unparsable dates.
pub fn normalize(payload: &Value) -> Result<Dashboard> {
    normalize_at(payload, Utc::now())
}

/// Validate and normalize with an explicit fallback timestamp.
pub fn normalize_at(payload: &Value, now: DateTime<Utc>) -> Result<Dashboard> {
    let verdict = validate(Some(payload));
    if !verdict.ok {
        return Err(EmrtError::PayloadRejected {
            reason: verdict.reason.unwrap_or_default(),
        });
    }

    let mut coerced = 0;
    let visits = points(payload.get("visits"), now, &mut coerced);
    let volume = points(payload.get("volume"), now, &mut coerced);

    Ok(Dashboard {
        visits,
        duration: series(payload.get("duration")),
        states: series(payload.get("states")),
        operators: series(payload.get("operators")),
        volume,
        coerced_dates: coerced,
    })
}

/// Coerce a date value. `None` means the fallback applies.
#[must_use]
pub fn coerce_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_text_timestamp(text),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() {
        return None;
    }
    if n.abs() > EPOCH_MILLIS_FLOOR {
        DateTime::from_timestamp_millis(n as i64)
    } else {
        DateTime::from_timestamp_millis((n * 1000.0) as i64)
    }
}

fn points(raw: Option<&Value>, now: DateTime<Utc>, coerced: &mut usize) -> Vec<VisitPoint> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let date = item.get("date").and_then(coerce_date).unwrap_or_else(|| {
                *coerced += 1;
                now
            });
            let value = item.get("value").and_then(count).unwrap_or(0);
            VisitPoint { date, value }
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.round() as u64)
    })
}

/// Items that do not match the expected shape are dropped.
fn series<T: DeserializeOwned>(raw: Option<&Value>) -> Vec<T> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

mod rfc3339_millis {
    use super::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate::{AggregateResult, VisitBucket};
    use proptest::prelude::*;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn absent_or_non_object_payload_fails() {
        assert!(!validate(None).ok);
        assert_eq!(
            validate(Some(&json!([1, 2]))).reason.as_deref(),
            Some("payload is not an object")
        );
        assert!(!validate(Some(&Value::Null)).ok);
    }

    #[test]
    fn visits_must_be_a_sequence() {
        assert_eq!(
            validate(Some(&json!({"states": []}))).reason.as_deref(),
            Some("visits missing")
        );
        assert_eq!(
            validate(Some(&json!({"visits": "nope"}))).reason.as_deref(),
            Some("visits is not a sequence")
        );
    }

    #[test]
    fn empty_visits_are_valid() {
        let payload = serde_json::to_value(AggregateResult::default()).unwrap();
        assert_eq!(validate(Some(&payload)), Validation::pass());
        let dash = normalize_at(&payload, fixed_now()).unwrap();
        assert!(dash.is_empty());
        assert_eq!(dash.coerced_dates, 0);
    }

    #[test]
    fn optional_series_default_to_empty() {
        let dash = normalize_at(
            &json!({"visits": [{"date": "2024-03-05T08:00:00.000Z", "value": 5}]}),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(dash.visits.len(), 1);
        assert!(dash.duration.is_empty());
        assert!(dash.states.is_empty());
        assert!(dash.operators.is_empty());
        assert!(dash.volume.is_empty());
    }

    #[test]
    fn malformed_optional_series_do_not_fail() {
        let dash = normalize_at(
            &json!({
                "visits": [],
                "states": "broken",
                "operators": [{"name": "SYSTEM", "value": 2}, {"oops": true}],
            }),
            fixed_now(),
        )
        .unwrap();
        assert!(dash.states.is_empty());
        assert_eq!(dash.operators.len(), 1);
    }

    #[test]
    fn dates_accept_iso_and_epoch_forms() {
        let expected = DateTime::parse_from_rfc3339("2024-03-05T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let dash = normalize_at(
            &json!({"visits": [
                {"date": "2024-03-05T08:00:00.000Z", "value": 1},
                {"date": 1_709_625_600, "value": 2},
                {"date": 1_709_625_600_000_i64, "value": 3},
            ]}),
            fixed_now(),
        )
        .unwrap();
        assert!(dash.visits.iter().all(|p| p.date == expected));
        assert_eq!(dash.coerced_dates, 0);
    }

    #[test]
    fn unparsable_dates_fall_back_to_now_and_are_counted() {
        let now = fixed_now();
        let dash = normalize_at(
            &json!({"visits": [
                {"date": "yesterday-ish", "value": 4},
                {"value": 1},
                {"date": null, "value": 2},
                {"date": "2024-03-05T08:00:00Z", "value": 3},
            ]}),
            now,
        )
        .unwrap();
        assert_eq!(dash.visits.len(), 4);
        assert_eq!(dash.coerced_dates, 3);
        assert_eq!(dash.visits[0].date, now);
        assert_eq!(dash.visits[0].value, 4);
        assert_ne!(dash.visits[3].date, now);
    }

    #[test]
    fn rejected_payload_surfaces_reason() {
        let err = normalize_at(&json!({"visits": 3}), fixed_now()).unwrap_err();
        assert_eq!(err.code(), "EMRT-2201");
        assert!(err.to_string().contains("visits is not a sequence"));
    }

    #[test]
    fn engine_result_round_trips_through_dashboard() {
        let result = AggregateResult {
            visits: vec![VisitBucket {
                date: "2024-03-05T09:00:00.000Z".to_string(),
                value: 10,
            }],
            states: vec![CategoryCount {
                category: "ADMIT".to_string(),
                value: 2,
            }],
            ..AggregateResult::default()
        };
        let dash = normalize_at(&serde_json::to_value(&result).unwrap(), fixed_now()).unwrap();
        let rendered = serde_json::to_value(&dash).unwrap();
        assert_eq!(rendered["visits"][0]["date"], "2024-03-05T09:00:00.000Z");
        assert_eq!(rendered["states"][0]["category"], "ADMIT");
    }

    #[test]
    fn epoch_unit_boundary_matches_engine() {
        use crate::engine::aggregate::parse_timestamp;
        use crate::engine::database::SqlValue;

        for n in [1_000_000_000_000_i64, 1_000_000_000_001, 1_709_625_600_000] {
            assert_eq!(
                coerce_date(&json!(n)),
                parse_timestamp(&SqlValue::Integer(n)),
                "unit disagreement at {n}"
            );
        }
    }

    proptest! {
        #[test]
        fn seconds_and_millis_agree(secs in 1_000_000_001_i64..4_000_000_000) {
            let from_secs = coerce_date(&json!(secs));
            let from_millis = coerce_date(&json!(secs * 1000));
            prop_assert!(from_secs.is_some());
            prop_assert_eq!(from_secs, from_millis);
        }

        #[test]
        fn visit_series_length_is_preserved(
            dates in proptest::collection::vec(
                prop_oneof![
                    any::<i64>().prop_map(|n| json!(n)),
                    "[a-z0-9:-]{0,24}".prop_map(|s| json!(s)),
                    Just(Value::Null),
                ],
                0..40,
            ),
        ) {
            let visits: Vec<Value> = dates
                .iter()
                .map(|d| json!({"date": d, "value": 1}))
                .collect();
            let dash = normalize_at(&json!({ "visits": visits }), fixed_now()).unwrap();
            prop_assert_eq!(dash.visits.len(), dates.len());
            prop_assert!(dash.coerced_dates <= dates.len());
        }
    }
}
