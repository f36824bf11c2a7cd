//! Flattening response trees into records.
//!
//! The walk is depth-first. Every object under a field with sub-selections
//! becomes its own [`Record`] and is replaced in its parent by a
//! [`Value::Reference`]. An object's key comes from the resolver when it
//! knows one, otherwise from the object's path in the tree:
//!
//! | position                       | key               |
//! |--------------------------------|-------------------|
//! | field directly under a root    | `field`           |
//! | field under any other record   | `parent.field`    |
//! | element `i` of a list field    | `<list path>.i`   |
//!
//! where `field` is the argument-qualified field identifier. The resolver
//! sees the object's leaf fields (those without sub-selections), already
//! converted to [`Value`]s. Children are keyed under the resolved key.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_core::{
    CacheKey, CompiledField, DefaultKeyResolver, KeyResolver, NormalizeError, Record,
    StrataResult, Value, Variables,
};

/// Records produced by one normalization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    /// Key of the record for the tree's entry point.
    pub root: CacheKey,
    pub records: BTreeMap<CacheKey, Record>,
}

impl RecordBatch {
    fn new(root: CacheKey) -> Self {
        Self {
            root,
            records: BTreeMap::new(),
        }
    }

    /// Add a record; a key seen twice in one tree has its fields merged.
    fn add(&mut self, record: Record) {
        match self.records.get_mut(record.key()) {
            Some(existing) => {
                existing.merge_in_place(&record);
            }
            None => {
                self.records.insert(record.key().clone(), record);
            }
        }
    }

    pub fn root_record(&self) -> Option<&Record> {
        self.records.get(&self.root)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

/// Turns response trees into [`RecordBatch`]es.
#[derive(Clone)]
pub struct Normalizer {
    resolver: Arc<dyn KeyResolver>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(DefaultKeyResolver))
    }
}

impl Normalizer {
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<dyn KeyResolver> {
        &self.resolver
    }

    /// Normalize `data`, the response for `selections`, under `root`.
    ///
    /// # Errors
    ///
    /// Fails when `data` is not a JSON object or when an argument refers to a
    /// variable missing from `variables`. Response keys absent from `data`
    /// are skipped.
    pub fn normalize(
        &self,
        root: &CacheKey,
        data: &serde_json::Value,
        selections: &[CompiledField],
        variables: &Variables,
    ) -> StrataResult<RecordBatch> {
        let object = data.as_object().ok_or_else(|| NormalizeError::RootNotObject {
            found: json_kind(data).to_string(),
        })?;

        let mut batch = RecordBatch::new(root.clone());
        let fields = self.normalize_fields(root, object, selections, variables, &mut batch)?;
        batch.add(Record::with_fields(root.clone(), fields));
        Ok(batch)
    }

    fn normalize_fields(
        &self,
        key: &CacheKey,
        object: &serde_json::Map<String, serde_json::Value>,
        selections: &[CompiledField],
        variables: &Variables,
        batch: &mut RecordBatch,
    ) -> StrataResult<BTreeMap<String, Value>> {
        let mut fields = BTreeMap::new();
        for field in selections {
            let Some(json) = object.get(field.response_name()) else {
                continue;
            };
            let field_key = field.cache_key(variables)?;
            let path = child_path(key, &field_key);
            let value = self.normalize_value(field, json, path, variables, batch)?;
            fields.insert(field_key, value);
        }
        Ok(fields)
    }

    fn normalize_value(
        &self,
        field: &CompiledField,
        json: &serde_json::Value,
        path: String,
        variables: &Variables,
        batch: &mut RecordBatch,
    ) -> StrataResult<Value> {
        if !field.is_composite() {
            return Ok(Value::from_json(json));
        }
        match json {
            serde_json::Value::Object(object) => {
                let key = self.object_key(field, object, path, variables)?;
                let fields =
                    self.normalize_fields(&key, object, &field.selections, variables, batch)?;
                batch.add(Record::with_fields(key.clone(), fields));
                Ok(Value::Reference(key))
            }
            serde_json::Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    self.normalize_value(field, item, format!("{}.{}", path, index), variables, batch)
                })
                .collect::<StrataResult<Vec<_>>>()
                .map(Value::List),
            other => Ok(Value::from_json(other)),
        }
    }

    fn object_key(
        &self,
        field: &CompiledField,
        object: &serde_json::Map<String, serde_json::Value>,
        path: String,
        variables: &Variables,
    ) -> StrataResult<CacheKey> {
        let mut record_set = BTreeMap::new();
        for child in field.selections.iter().filter(|child| !child.is_composite()) {
            if let Some(json) = object.get(child.response_name()) {
                record_set.insert(child.cache_key(variables)?, Value::from_json(json));
            }
        }
        Ok(self
            .resolver
            .from_field_record_set(field, variables, &record_set)
            .unwrap_or_else(|| CacheKey::new(path)))
    }
}

/// Path key of a field under `parent`.
fn child_path(parent: &CacheKey, field_key: &str) -> String {
    if parent.is_root() {
        field_key.to_string()
    } else {
        format!("{}.{}", parent, field_key)
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
