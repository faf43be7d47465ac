//! Record values: normalization and type inference
//!
//! Records enter the engine as JSON objects. Before a value participates in
//! schema inference it is normalized: timestamp strings are rebased to UTC,
//! everything else keeps its original width and representation. Inference
//! maps a single normalized value onto a [`DataType`].

use crate::datatype::DataType;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// A single schemaless record: field name to JSON value, insertion-ordered.
pub type Object = serde_json::Map<String, Value>;

/// Policy knobs for value typing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypePolicy {
    /// Treat floats that equal their integer truncation as `Int64`.
    pub round_floats_to_int: bool,
}

/// Parse a string as a strict RFC 3339 timestamp.
///
/// Dates without a time component and loosely formatted timestamps are
/// rejected so that ordinary strings are not misread as timestamps.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Infer the logical type of a single normalized value.
pub fn infer_type(value: &Value, policy: TypePolicy) -> DataType {
    match value {
        Value::Null => DataType::Unknown,
        Value::Bool(_) => DataType::Bool,
        Value::Number(n) => {
            if n.is_i64() {
                DataType::Int64
            } else if n.is_u64() {
                // Beyond i64 range: widen rather than overflow.
                DataType::Float64
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if policy.round_floats_to_int && f.is_finite() && f == f.trunc() {
                    DataType::Int64
                } else {
                    DataType::Float64
                }
            }
        }
        Value::String(s) => {
            if parse_timestamp(s).is_some() {
                DataType::Timestamp
            } else {
                DataType::String
            }
        }
        Value::Array(_) | Value::Object(_) => DataType::Json,
    }
}

/// Normalize a record in place.
///
/// Timestamp strings carrying a non-UTC offset are rewritten in UTC; strings
/// already in UTC are left byte-identical so that caller-supplied literals
/// survive overrides untouched. Numeric strings stay strings.
pub fn normalize_object(object: &mut Object) {
    for (_, value) in object.iter_mut() {
        normalize_value(value);
    }
}

fn normalize_value(value: &mut Value) {
    if let Value::String(s) = value {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
            if parsed.offset().local_minus_utc() != 0 {
                *value = Value::String(
                    parsed
                        .with_timezone(&Utc)
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_primitives() {
        let policy = TypePolicy::default();
        assert_eq!(infer_type(&json!(null), policy), DataType::Unknown);
        assert_eq!(infer_type(&json!(true), policy), DataType::Bool);
        assert_eq!(infer_type(&json!(42), policy), DataType::Int64);
        assert_eq!(infer_type(&json!(1.5), policy), DataType::Float64);
        assert_eq!(infer_type(&json!("hello"), policy), DataType::String);
        assert_eq!(infer_type(&json!([1, 2]), policy), DataType::Json);
        assert_eq!(infer_type(&json!({"a": 1}), policy), DataType::Json);
    }

    #[test]
    fn test_infer_timestamp_strings() {
        let policy = TypePolicy::default();
        assert_eq!(
            infer_type(&json!("2023-01-01T00:00:00Z"), policy),
            DataType::Timestamp
        );
        assert_eq!(
            infer_type(&json!("2022-08-18T14:17:22.375Z"), policy),
            DataType::Timestamp
        );
        // Date-only and loose formats stay strings
        assert_eq!(infer_type(&json!("2023-01-01"), policy), DataType::String);
        assert_eq!(
            infer_type(&json!("2023-01-01 00:00:00"), policy),
            DataType::String
        );
    }

    #[test]
    fn test_numeric_strings_stay_strings() {
        let policy = TypePolicy::default();
        assert_eq!(infer_type(&json!("42"), policy), DataType::String);
        assert_eq!(infer_type(&json!("1.5"), policy), DataType::String);
    }

    #[test]
    fn test_round_floats_policy() {
        let strict = TypePolicy::default();
        let rounding = TypePolicy {
            round_floats_to_int: true,
        };
        assert_eq!(infer_type(&json!(1.0), strict), DataType::Float64);
        assert_eq!(infer_type(&json!(1.0), rounding), DataType::Int64);
        assert_eq!(infer_type(&json!(1.5), rounding), DataType::Float64);
    }

    #[test]
    fn test_u64_overflow_widens() {
        let policy = TypePolicy::default();
        assert_eq!(infer_type(&json!(u64::MAX), policy), DataType::Float64);
        assert_eq!(infer_type(&json!(i64::MAX), policy), DataType::Int64);
    }

    #[test]
    fn test_normalize_rebases_offsets_to_utc() {
        let mut obj: Object = json!({"t": "2023-01-01T02:00:00+02:00"})
            .as_object()
            .unwrap()
            .clone();
        normalize_object(&mut obj);
        assert_eq!(obj["t"], json!("2023-01-01T00:00:00Z"));
    }

    #[test]
    fn test_normalize_keeps_utc_literals() {
        let mut obj: Object = json!({"t": "2023-01-01T00:00:00Z", "s": "plain", "n": 3})
            .as_object()
            .unwrap()
            .clone();
        normalize_object(&mut obj);
        assert_eq!(obj["t"], json!("2023-01-01T00:00:00Z"));
        assert_eq!(obj["s"], json!("plain"));
        assert_eq!(obj["n"], json!(3));
    }
}
