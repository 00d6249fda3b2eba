//! The tagged value type carried by every row column (§3).

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A single cell value. Nulls propagate per SQL three-valued logic in
/// comparisons and arithmetic (see `compare` and `crate::expr`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Decimal(Decimal),
    Float(f64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Decimal(_) | Value::Float(_))
    }

    /// Best-effort conversion to `f64` for numeric comparison/arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Decimal(d) => d.to_string().parse().ok(),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Invariant-culture string form used for key normalization (§4.6) and
    /// composite-key construction in set operations (§4.8).
    pub fn canonical_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.to_uppercase(),
            Value::Int(i) => i.to_string(),
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Uuid(u) => u.to_string().to_uppercase(),
            Value::Timestamp(t) => t.to_rfc3339(),
        }
    }

    /// Human-readable string form (PRINT, ERROR_MESSAGE(), display projections).
    pub fn display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Uuid(u) => u.to_string(),
            Value::Timestamp(t) => t.to_rfc3339(),
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Null => None,
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_string())
    }
}

/// Typed three-way comparison following §4.4's rules: numeric compare if
/// both numeric, typed compare for timestamp/uuid, otherwise
/// case-insensitive string compare. Caller handles null placement.
pub fn compare_non_null(a: &Value, b: &Value) -> Ordering {
    if a.is_numeric() && b.is_numeric() {
        let (af, bf) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
        return af.partial_cmp(&bf).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a
            .display_string()
            .to_uppercase()
            .cmp(&b.display_string().to_uppercase()),
    }
}

/// Sort-key comparison with SQL "nulls sort last" semantics (§4.4). Used by
/// `ClientSort` and `MergeJoin`'s key walk.
pub fn compare_nulls_last(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare_non_null(a, b),
    }
}
