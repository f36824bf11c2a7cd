//! Normalized records and the field-level merge engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{CacheKey, FieldPath, Value};

const SIZE_OF_RECORD_OVERHEAD: usize = 16;

/// A flat field map representing one normalized object.
///
/// Field identifiers are field names, qualified by resolved arguments when the
/// field takes any (`user({"id":1})`). Nested objects are stored as
/// [`Value::Reference`]s to other records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    key: CacheKey,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_fields(key: CacheKey, fields: BTreeMap<String, Value>) -> Self {
        Self { key, fields }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(name.into(), value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every field of this record as a path, prefixed by the record key.
    pub fn field_paths(&self) -> BTreeSet<FieldPath> {
        self.fields
            .keys()
            .map(|name| FieldPath::new(self.key.clone(), name.clone()))
            .collect()
    }

    /// Keys this record points to in one hop, deduplicated, in field order.
    pub fn referenced_keys(&self) -> Vec<CacheKey> {
        let mut refs = Vec::new();
        for value in self.fields.values() {
            value.collect_references(&mut refs);
        }
        let mut seen = BTreeSet::new();
        refs.retain(|key| seen.insert(key.clone()));
        refs
    }

    /// Estimated weight of the record, excluding its key.
    pub fn size_in_bytes(&self) -> usize {
        SIZE_OF_RECORD_OVERHEAD
            + self
                .fields
                .iter()
                .map(|(name, value)| name.len() + value.size_in_bytes())
                .sum::<usize>()
    }

    /// Merge `incoming` into a copy of this record.
    ///
    /// Fields only present here are preserved. Incoming fields that are new or
    /// differ under canonical value equality overwrite and are reported;
    /// identical fields are neither touched nor reported. Merge never follows
    /// references.
    pub fn merge_with(&self, incoming: &Record) -> (Record, BTreeSet<FieldPath>) {
        let mut merged = self.clone();
        let changed = merged.merge_in_place(incoming);
        (merged, changed)
    }

    /// In-place variant of [`Record::merge_with`], used by tiers that own the
    /// stored record behind a per-key guard.
    pub fn merge_in_place(&mut self, incoming: &Record) -> BTreeSet<FieldPath> {
        let mut changed = BTreeSet::new();
        for (name, new_value) in &incoming.fields {
            let differs = match self.fields.get(name) {
                Some(old_value) => old_value != new_value,
                None => true,
            };
            if differs {
                self.fields.insert(name.clone(), new_value.clone());
                changed.insert(FieldPath::new(self.key.clone(), name.clone()));
            }
        }
        changed
    }
}

/// Merge `incoming` into an optional existing record.
///
/// With no existing record the incoming one is taken verbatim and every field
/// it carries counts as changed.
pub fn merge_records(existing: Option<&Record>, incoming: &Record) -> (Record, BTreeSet<FieldPath>) {
    match existing {
        Some(record) => record.merge_with(incoming),
        None => (incoming.clone(), incoming.field_paths()),
    }
}
