//! Backend-neutral row representation used by the generic table operations.
//!
//! A [`DynRow`] keeps columns in the order the backend returned them, so a row
//! read from one store can be written to another without per-table code.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged scalar stored in a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DynValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Column name -> value, in column order.
pub type DynRow = IndexMap<String, DynValue>;

impl DynValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DynValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Loose equality used by key lookups: integers compare across text
    /// renderings so `"42"` matches `42` the way a SQL comparison would.
    pub fn matches(&self, other: &DynValue) -> bool {
        match (self, other) {
            (DynValue::Int(a), DynValue::Text(b)) | (DynValue::Text(b), DynValue::Int(a)) => {
                b.trim().parse::<i64>().map(|b| b == *a).unwrap_or(false)
            }
            (DynValue::Null, _) | (_, DynValue::Null) => false,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynValue::Null => write!(f, "NULL"),
            DynValue::Bool(v) => write!(f, "{v}"),
            DynValue::Int(v) => write!(f, "{v}"),
            DynValue::Float(v) => write!(f, "{v}"),
            DynValue::Text(v) => write!(f, "{v}"),
            DynValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i64> for DynValue {
    fn from(v: i64) -> Self {
        DynValue::Int(v)
    }
}

impl From<i32> for DynValue {
    fn from(v: i32) -> Self {
        DynValue::Int(v as i64)
    }
}

impl From<bool> for DynValue {
    fn from(v: bool) -> Self {
        DynValue::Bool(v)
    }
}

impl From<f64> for DynValue {
    fn from(v: f64) -> Self {
        DynValue::Float(v)
    }
}

impl From<&str> for DynValue {
    fn from(v: &str) -> Self {
        DynValue::Text(v.to_string())
    }
}

impl From<String> for DynValue {
    fn from(v: String) -> Self {
        DynValue::Text(v)
    }
}

impl From<DateTime<Utc>> for DynValue {
    fn from(v: DateTime<Utc>) -> Self {
        DynValue::Timestamp(v)
    }
}

impl<T: Into<DynValue>> From<Option<T>> for DynValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DynValue::Null)
    }
}

/// Integer primary key of a row, if it carries one.
pub fn row_id(row: &DynRow) -> Option<i64> {
    row.get("id").and_then(DynValue::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_compares_ints_with_numeric_text() {
        assert!(DynValue::Int(42).matches(&DynValue::Text("42".into())));
        assert!(DynValue::Text(" 7".into()).matches(&DynValue::Int(7)));
        assert!(!DynValue::Int(42).matches(&DynValue::Text("x42".into())));
        assert!(!DynValue::Null.matches(&DynValue::Null));
    }

    #[test]
    fn option_converts_to_null() {
        let v: DynValue = Option::<String>::None.into();
        assert!(v.is_null());
        let v: DynValue = Some("m5.large").into();
        assert_eq!(v.as_str(), Some("m5.large"));
    }

    #[test]
    fn row_keeps_insertion_order() {
        let mut row = DynRow::new();
        row.insert("id".into(), 3i64.into());
        row.insert("sku_code".into(), "ABC".into());
        row.insert("vcpu".into(), 2i32.into());
        let cols: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(cols, ["id", "sku_code", "vcpu"]);
        assert_eq!(row_id(&row), Some(3));
    }
}
