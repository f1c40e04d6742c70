//! The dynamic argument/value type bound to positional placeholders.

use chrono::{DateTime, Utc};
use std::fmt;

/// A value bound to a query placeholder, or returned from a scan.
///
/// This is intentionally a closed, driver-agnostic sum type rather
/// than a trait object: the binder coerces from whatever the live
/// driver handed back into one of these variants before the rest of
/// the crate ever sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(Option<i32>),
    Int64(Option<i64>),
    Float(Option<f32>),
    Double(Option<f64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    Boolean(Option<bool>),
    DateTime(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

impl Value {
    pub fn int32(v: impl Into<i32>) -> Self {
        Value::Int32(Some(v.into()))
    }

    pub fn int64(v: impl Into<i64>) -> Self {
        Value::Int64(Some(v.into()))
    }

    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(Some(v.into()))
    }

    pub fn boolean(v: bool) -> Self {
        Value::Boolean(Some(v))
    }

    pub fn null_int64() -> Self {
        Value::Int64(None)
    }

    pub fn null_text() -> Self {
        Value::Text(None)
    }

    /// `true` when this value carries SQL `NULL`.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Int32(v) => v.is_none(),
            Value::Int64(v) => v.is_none(),
            Value::Float(v) => v.is_none(),
            Value::Double(v) => v.is_none(),
            Value::Text(v) => v.is_none(),
            Value::Bytes(v) => v.is_none(),
            Value::Boolean(v) => v.is_none(),
            Value::DateTime(v) => v.is_none(),
            Value::Json(v) => v.is_none(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => v.map(|x| x as i64),
            Value::Int64(v) => *v,
            Value::Float(v) => v.map(|x| x as i64),
            Value::Double(v) => v.map(|x| x as i64),
            Value::Text(Some(s)) => s.trim().parse().ok(),
            Value::Bytes(Some(b)) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            Value::Boolean(Some(b)) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => v.map(|x| x as f64),
            Value::Int64(v) => v.map(|x| x as f64),
            Value::Float(v) => v.map(|x| x as f64),
            Value::Double(v) => *v,
            Value::Text(Some(s)) => s.trim().parse().ok(),
            Value::Bytes(Some(b)) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => *v,
            Value::Int32(Some(i)) => Some(*i != 0),
            Value::Int64(Some(i)) => Some(*i != 0),
            Value::Text(Some(s)) => match s.to_lowercase().as_str() {
                "t" | "true" | "1" | "yes" => Some(true),
                "f" | "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Value::Bytes(Some(b)) => {
                let s = std::str::from_utf8(b).ok()?.to_lowercase();
                match s.as_str() {
                    "t" | "true" | "1" | "yes" => Some(true),
                    "f" | "false" | "0" | "no" => Some(false),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(Some(s)) => Some(s.as_str()),
            Value::Bytes(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// `true` when this value is the type's zero value, used by the
    /// `where_struct` "zero is absent" rule.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int32(Some(0)) => true,
            Value::Int64(Some(0)) => true,
            Value::Float(Some(f)) => *f == 0.0,
            Value::Double(Some(f)) => *f == 0.0,
            Value::Text(Some(s)) => s.is_empty(),
            Value::Boolean(Some(false)) => true,
            Value::Bytes(Some(b)) => b.is_empty(),
            Value::Int32(None)
            | Value::Int64(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::Text(None)
            | Value::Bytes(None)
            | Value::Boolean(None)
            | Value::DateTime(None)
            | Value::Json(None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "NULL");
        }
        match self {
            Value::Int32(Some(v)) => write!(f, "{v}"),
            Value::Int64(Some(v)) => write!(f, "{v}"),
            Value::Float(Some(v)) => write!(f, "{v}"),
            Value::Double(Some(v)) => write!(f, "{v}"),
            Value::Text(Some(v)) => write!(f, "{v}"),
            Value::Bytes(Some(v)) => write!(f, "{v:?}"),
            Value::Boolean(Some(v)) => write!(f, "{v}"),
            Value::DateTime(Some(v)) => write!(f, "{}", v.to_rfc3339()),
            Value::Json(Some(v)) => write!(f, "{v}"),
            _ => unreachable!("is_null handled above"),
        }
    }
}

macro_rules! from_impl {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(Some(v.into()))
            }
        }

        impl From<Option<$t>> for Value {
            fn from(v: Option<$t>) -> Self {
                match v {
                    Some(v) => Value::$variant(Some(v.into())),
                    None => Value::$variant(None),
                }
            }
        }
    };
}

from_impl!(i32, Int32);
from_impl!(i64, Int64);
from_impl!(f32, Float);
from_impl!(f64, Double);
from_impl!(String, Text);
from_impl!(bool, Boolean);
from_impl!(Vec<u8>, Bytes);
from_impl!(DateTime<Utc>, DateTime);
from_impl!(serde_json::Value, Json);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(Some(v.to_string()))
    }
}
