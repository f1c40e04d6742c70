//! Driver-value → field-kind coercion table.

use crate::ast::Value;
use crate::error::{Error, ErrorKind};
use crate::schema::FieldKind;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Coerce a raw value returned by the driver into the representation
/// required by `kind`, or a scan error naming `column` on failure.
pub fn coerce(value: &Value, kind: FieldKind, nullable: bool, column: &str) -> crate::Result<Value> {
    if value.is_null() {
        return if nullable {
            Ok(value.clone())
        } else {
            Err(scan_error(column, "unexpected NULL for non-nullable column"))
        };
    }

    match kind {
        FieldKind::SignedInt => value
            .as_i64()
            .map(Value::int64)
            .ok_or_else(|| scan_error(column, "could not coerce value to a signed integer")),
        FieldKind::UnsignedInt => match value.as_i64() {
            Some(i) if i >= 0 => Ok(Value::int64(i)),
            Some(_) => Err(scan_error(column, "negative value for an unsigned integer column")),
            None => Err(scan_error(column, "could not coerce value to an unsigned integer")),
        },
        FieldKind::Float => match value.as_f64() {
            Some(f) => Ok(Value::Double(Some(f))),
            None => Err(scan_error(column, "could not coerce value to a float")),
        },
        FieldKind::Boolean => value
            .as_bool()
            .map(Value::boolean)
            .ok_or_else(|| scan_error(column, "could not coerce value to a boolean")),
        FieldKind::String => value
            .as_str()
            .map(Value::text)
            .ok_or_else(|| scan_error(column, "could not coerce value to a string")),
        FieldKind::Time => coerce_time(value).ok_or_else(|| scan_error(column, "could not coerce value to a timestamp")),
        FieldKind::Json => match value {
            Value::Json(_) => Ok(value.clone()),
            Value::Text(Some(s)) => serde_json::from_str(s)
                .map(|parsed| Value::Json(Some(parsed)))
                .map_err(|_| scan_error(column, "could not parse value as JSON")),
            _ => Err(scan_error(column, "could not coerce value to JSON")),
        },
        FieldKind::Bytes => match value {
            Value::Bytes(_) => Ok(value.clone()),
            Value::Text(Some(s)) => Ok(Value::Bytes(Some(s.clone().into_bytes()))),
            _ => Err(scan_error(column, "could not coerce value to bytes")),
        },
        FieldKind::Scanner => Ok(value.clone()),
    }
}

fn coerce_time(value: &Value) -> Option<Value> {
    match value {
        Value::DateTime(Some(_)) => Some(value.clone()),
        Value::Text(Some(s)) => parse_time(s).map(|dt| Value::DateTime(Some(dt))),
        Value::Bytes(Some(b)) => std::str::from_utf8(b).ok().and_then(parse_time).map(|dt| Value::DateTime(Some(dt))),
        _ => None,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

fn scan_error(column: &str, message: &str) -> Error {
    Error::new(ErrorKind::ColumnNotFound {
        column: crate::error::Name::available(column),
    })
    .with_operation("scan")
    .with_query(message, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_numeric_string_to_signed_int() {
        let v = coerce(&Value::text("42"), FieldKind::SignedInt, false, "n").unwrap();
        assert_eq!(v.as_i64(), Some(42));
    }

    #[test]
    fn coerces_int_to_bool() {
        let v = coerce(&Value::int32(1), FieldKind::Boolean, false, "flag").unwrap();
        assert_eq!(v.as_bool(), Some(true));
    }

    #[test]
    fn null_clears_optional_field() {
        let v = coerce(&Value::null_text(), FieldKind::String, true, "opt").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn null_rejected_for_non_nullable() {
        let err = coerce(&Value::null_text(), FieldKind::String, false, "name").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ColumnNotFound { .. }));
    }

    #[test]
    fn rfc3339_time_parses() {
        let v = coerce(&Value::text("2024-01-01T00:00:00Z"), FieldKind::Time, false, "created_at").unwrap();
        assert!(matches!(v, Value::DateTime(Some(_))));
    }

    #[test]
    fn json_text_is_parsed_into_json_variant() {
        let v = coerce(&Value::text(r#"{"a":1}"#), FieldKind::Json, false, "payload").unwrap();
        match v {
            Value::Json(Some(parsed)) => assert_eq!(parsed, serde_json::json!({"a": 1})),
            other => panic!("expected Value::Json, got {other:?}"),
        }
    }

    #[test]
    fn unsigned_rejects_negative() {
        let err = coerce(&Value::int32(-1), FieldKind::UnsignedInt, false, "count").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ColumnNotFound { .. }));
    }
}
