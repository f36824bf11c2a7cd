//! Field-selection shape and variables.
//!
//! This is the slice of a compiled query the cache needs: field names,
//! aliases, arguments (possibly bound to variables) and nested selections.
//! Parsing and validating the query language happens elsewhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{NormalizeError, StrataResult};

/// Variables an operation was executed with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, serde_json::Value>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Build from a JSON object; any other JSON yields no variables.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Object(map) => Self(map.into_iter().collect()),
            _ => Self::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }
}

/// An argument value as written in the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputValue {
    Literal(serde_json::Value),
    Variable(String),
    List(Vec<InputValue>),
    Object(BTreeMap<String, InputValue>),
}

impl InputValue {
    pub fn variable(name: impl Into<String>) -> Self {
        InputValue::Variable(name.into())
    }

    fn resolve(&self, field: &str, variables: &Variables) -> StrataResult<serde_json::Value> {
        match self {
            InputValue::Literal(json) => Ok(json.clone()),
            InputValue::Variable(name) => variables.get(name).cloned().ok_or_else(|| {
                NormalizeError::UndefinedVariable {
                    name: name.clone(),
                    field: field.to_string(),
                }
                .into()
            }),
            InputValue::List(items) => items
                .iter()
                .map(|item| item.resolve(field, variables))
                .collect::<StrataResult<Vec<_>>>()
                .map(serde_json::Value::Array),
            InputValue::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (name, value) in entries {
                    map.insert(name.clone(), value.resolve(field, variables)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
    }
}

impl From<serde_json::Value> for InputValue {
    fn from(json: serde_json::Value) -> Self {
        InputValue::Literal(json)
    }
}

/// One selected field of a compiled operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledField {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: BTreeMap<String, InputValue>,
    /// Sub-selections; empty for leaf (scalar or list-of-scalar) fields.
    pub selections: Vec<CompiledField>,
}

impl CompiledField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: BTreeMap::new(),
            selections: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_selections(mut self, selections: Vec<CompiledField>) -> Self {
        self.selections = selections;
        self
    }

    /// The key this field appears under in a response tree.
    pub fn response_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether this field selects an object (or list of objects).
    pub fn is_composite(&self) -> bool {
        !self.selections.is_empty()
    }

    /// Resolve one argument against the variables; `None` if not passed.
    pub fn resolve_argument(
        &self,
        name: &str,
        variables: &Variables,
    ) -> StrataResult<Option<serde_json::Value>> {
        self.arguments
            .get(name)
            .map(|value| value.resolve(&self.name, variables))
            .transpose()
    }

    pub fn resolved_arguments(
        &self,
        variables: &Variables,
    ) -> StrataResult<BTreeMap<String, serde_json::Value>> {
        self.arguments
            .iter()
            .map(|(name, value)| -> StrataResult<(String, serde_json::Value)> {
                Ok((name.clone(), value.resolve(&self.name, variables)?))
            })
            .collect()
    }

    /// The field identifier used inside a record.
    ///
    /// Fields without arguments use their bare name; fields with arguments
    /// append the resolved arguments as canonical JSON, so `user(id: 1)` and
    /// `user(id: 2)` are distinct entries of the same record.
    pub fn cache_key(&self, variables: &Variables) -> StrataResult<String> {
        if self.arguments.is_empty() {
            return Ok(self.name.clone());
        }
        let resolved = self.resolved_arguments(variables)?;
        let mut out = String::with_capacity(self.name.len() + 16);
        out.push_str(&self.name);
        out.push('(');
        write_canonical_object(resolved.iter(), &mut out);
        out.push(')');
        Ok(out)
    }
}

/// Serialize JSON with object keys sorted at every depth.
pub fn canonical_json(json: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(json, &mut out);
    out
}

fn write_canonical(json: &serde_json::Value, out: &mut String) {
    match json {
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_canonical_object(entries.into_iter(), out);
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

fn write_canonical_object<'a>(
    entries: impl Iterator<Item = (&'a String, &'a serde_json::Value)>,
    out: &mut String,
) {
    out.push('{');
    for (i, (name, value)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}
