//! Field values stored inside records.
//!
//! Values form a closed tagged union so that merge and equality are checked
//! exhaustively. Nested objects never appear here: the normalizer replaces
//! them with [`Value::Reference`] before a record is built.

use serde::{Deserialize, Serialize};

use crate::CacheKey;

const SIZE_OF_NULL: usize = 4;
const SIZE_OF_BOOLEAN: usize = 16;
const SIZE_OF_NUMBER: usize = 16;
const SIZE_OF_LIST_OVERHEAD: usize = 16;
const SIZE_OF_REFERENCE_OVERHEAD: usize = 16;
const SIZE_OF_CUSTOM_OVERHEAD: usize = 16;

/// A single field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Opaque custom scalar (any JSON the schema does not break down further).
    Custom(serde_json::Value),
    List(Vec<Value>),
    /// Non-owning pointer to another record.
    Reference(CacheKey),
}

impl Value {
    /// Convert a leaf of a response tree into a value.
    ///
    /// JSON objects become opaque [`Value::Custom`] scalars; the normalizer
    /// handles objects that carry a selection set before this is reached.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    // Beyond i64 range: keep the exact representation.
                    Value::Custom(json.clone())
                } else {
                    n.as_f64()
                        .map(Value::Float)
                        .unwrap_or_else(|| Value::Custom(json.clone()))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Custom(json.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            Value::Reference(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Append every key this value points to, in list order.
    pub fn collect_references(&self, out: &mut Vec<CacheKey>) {
        match self {
            Value::Reference(key) => out.push(key.clone()),
            Value::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Value::Null
            | Value::Boolean(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Custom(_) => {}
        }
    }

    /// Estimated in-memory weight of this value.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Value::Null => SIZE_OF_NULL,
            Value::Boolean(_) => SIZE_OF_BOOLEAN,
            Value::Int(_) | Value::Float(_) => SIZE_OF_NUMBER,
            Value::String(s) => s.len(),
            Value::Custom(json) => SIZE_OF_CUSTOM_OVERHEAD + json.to_string().len(),
            Value::List(items) => {
                SIZE_OF_LIST_OVERHEAD + items.iter().map(Value::size_in_bytes).sum::<usize>()
            }
            Value::Reference(key) => SIZE_OF_REFERENCE_OVERHEAD + key.size_in_bytes(),
        }
    }
}

/// Canonical value equality.
///
/// Numbers compare by value, not by representation: `Int(1) == Float(1.0)`,
/// `-0.0 == 0.0`, and NaN equals NaN. References compare by target key.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                int_float_eq(*i, *f)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            _ => false,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

// 2^63, the first float outside i64 range.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// The `i64` a float denotes exactly, if any.
pub(crate) fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f)).then(|| f as i64)
}

fn int_float_eq(i: i64, f: f64) -> bool {
    integral(f) == Some(i)
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<CacheKey> for Value {
    fn from(key: CacheKey) -> Self {
        Value::Reference(key)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
