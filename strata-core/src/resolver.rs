//! Identity resolution for normalized objects.
//!
//! A resolver decides which objects get identity-based keys. Whenever it
//! returns `None`, the normalizer falls back to the object's structural path
//! in the response tree, so types can opt into identity one at a time without
//! touching merge or eviction.
//!
//! # Contract
//!
//! Both methods must be pure and deterministic: the same field, variables and
//! object body always yield the same key. Returning different keys for what is
//! logically the same object is a usage error the cache does not detect.

use std::collections::BTreeMap;

use crate::field::canonical_json;
use crate::value::integral;
use crate::{CacheKey, CompiledField, Value, Variables};

/// Maps a field to a stable identity key.
pub trait KeyResolver: Send + Sync {
    /// Resolve identity once the object's own fields are known.
    fn from_field_record_set(
        &self,
        field: &CompiledField,
        variables: &Variables,
        record_set: &BTreeMap<String, Value>,
    ) -> Option<CacheKey>;

    /// Predict identity from arguments alone, before the object is available.
    fn from_field_arguments(&self, field: &CompiledField, variables: &Variables)
        -> Option<CacheKey>;
}

/// Resolver that never assigns identity; every object is path-keyed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyResolver;

impl KeyResolver for DefaultKeyResolver {
    fn from_field_record_set(
        &self,
        _field: &CompiledField,
        _variables: &Variables,
        _record_set: &BTreeMap<String, Value>,
    ) -> Option<CacheKey> {
        None
    }

    fn from_field_arguments(
        &self,
        _field: &CompiledField,
        _variables: &Variables,
    ) -> Option<CacheKey> {
        None
    }
}

/// Resolver keying objects by an id field, or by the argument of the same name.
#[derive(Debug, Clone)]
pub struct IdFieldKeyResolver {
    id_field: String,
}

impl IdFieldKeyResolver {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    fn format_key(id: String) -> Option<CacheKey> {
        if id.is_empty() {
            None
        } else {
            Some(CacheKey::new(id))
        }
    }
}

/// Text of a numeric id. Integral floats print like integers, so `42` and
/// `42.0` name one record.
fn number_id(f: f64) -> String {
    match integral(f) {
        Some(i) => i.to_string(),
        None => f.to_string(),
    }
}

/// Text of an id given as JSON, shared by both resolution paths. Lists and
/// nulls never identify an object.
fn json_id(json: &serde_json::Value) -> Option<String> {
    match json {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(f)) => Some(number_id(f)),
            (None, None) => Some(n.to_string()),
        },
        serde_json::Value::Object(_) => Some(canonical_json(json)),
        serde_json::Value::Null | serde_json::Value::Array(_) => None,
    }
}

impl Default for IdFieldKeyResolver {
    fn default() -> Self {
        Self::new("id")
    }
}

impl KeyResolver for IdFieldKeyResolver {
    fn from_field_record_set(
        &self,
        _field: &CompiledField,
        _variables: &Variables,
        record_set: &BTreeMap<String, Value>,
    ) -> Option<CacheKey> {
        let id = match record_set.get(&self.id_field)? {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => number_id(*f),
            Value::Boolean(b) => b.to_string(),
            Value::Custom(json) => json_id(json)?,
            Value::Null | Value::List(_) | Value::Reference(_) => return None,
        };
        Self::format_key(id)
    }

    fn from_field_arguments(
        &self,
        field: &CompiledField,
        variables: &Variables,
    ) -> Option<CacheKey> {
        let id = field.resolve_argument(&self.id_field, variables).ok()??;
        Self::format_key(json_id(&id)?)
    }
}
