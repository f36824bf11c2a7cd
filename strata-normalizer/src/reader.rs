//! Rebuilding response trees from records.
//!
//! The reader is the inverse of the normalizer: starting at a root key it
//! loads records through the [`TierChain`], selects the requested fields and
//! follows references to rebuild the nested JSON. Any missing record, field
//! or reference target turns the whole read into a miss.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use strata_core::{CacheHeaders, CacheKey, CompiledField, KeyResolver, StrataResult, Value, Variables};
use strata_storage::TierChain;

/// A successful denormalized read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub data: serde_json::Value,
    /// Every record the read touched. A later change to any of them may
    /// change the result.
    pub dependent_keys: BTreeSet<CacheKey>,
}

type ReadFuture<'f> =
    Pin<Box<dyn Future<Output = StrataResult<Option<serde_json::Value>>> + Send + 'f>>;

#[derive(Clone, Copy)]
struct Scope<'f> {
    variables: &'f Variables,
    headers: &'f CacheHeaders,
}

/// Denormalizing reader over a tier chain.
#[derive(Clone)]
pub struct Reader {
    chain: Arc<TierChain>,
    resolver: Arc<dyn KeyResolver>,
}

impl Reader {
    pub fn new(chain: Arc<TierChain>, resolver: Arc<dyn KeyResolver>) -> Self {
        Self { chain, resolver }
    }

    /// Read `selections` starting at `root`; `None` on any miss.
    pub async fn read(
        &self,
        root: &CacheKey,
        selections: &[CompiledField],
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> StrataResult<Option<ReadResult>> {
        let scope = Scope { variables, headers };
        let mut dependent_keys = BTreeSet::new();
        let data = self
            .read_object(root.clone(), selections, scope, &mut dependent_keys)
            .await?;
        Ok(data.map(|data| ReadResult {
            data,
            dependent_keys,
        }))
    }

    fn read_object<'f>(
        &'f self,
        key: CacheKey,
        selections: &'f [CompiledField],
        scope: Scope<'f>,
        dependent_keys: &'f mut BTreeSet<CacheKey>,
    ) -> ReadFuture<'f> {
        Box::pin(async move {
            let Some(record) = self.chain.load(&key, scope.headers).await? else {
                tracing::trace!(key = %key, "record miss");
                return Ok(None);
            };
            dependent_keys.insert(key);

            let mut object = serde_json::Map::new();
            for field in selections {
                let field_key = field.cache_key(scope.variables)?;
                let value = match record.field(&field_key) {
                    Some(value) => {
                        self.read_value(field, value, scope, &mut *dependent_keys)
                            .await?
                    }
                    None => match self.predicted_key(field, scope) {
                        Some(target) => {
                            self.read_object(target, &field.selections, scope, &mut *dependent_keys)
                                .await?
                        }
                        None => {
                            tracing::trace!(key = %record.key(), field = %field_key, "field miss");
                            None
                        }
                    },
                };
                let Some(value) = value else {
                    return Ok(None);
                };
                object.insert(field.response_name().to_string(), value);
            }
            Ok(Some(serde_json::Value::Object(object)))
        })
    }

    fn read_value<'f>(
        &'f self,
        field: &'f CompiledField,
        value: &'f Value,
        scope: Scope<'f>,
        dependent_keys: &'f mut BTreeSet<CacheKey>,
    ) -> ReadFuture<'f> {
        Box::pin(async move {
            match value {
                Value::Reference(target) if field.is_composite() => {
                    self.read_object(target.clone(), &field.selections, scope, dependent_keys)
                        .await
                }
                Value::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match self.read_value(field, item, scope, &mut *dependent_keys).await? {
                            Some(json) => out.push(json),
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(serde_json::Value::Array(out)))
                }
                leaf => Ok(Some(to_json(leaf))),
            }
        })
    }

    /// Key the resolver predicts for a composite field from its arguments.
    fn predicted_key(&self, field: &CompiledField, scope: Scope<'_>) -> Option<CacheKey> {
        if !field.is_composite() {
            return None;
        }
        self.resolver.from_field_arguments(field, scope.variables)
    }
}

/// Convert a stored value back into response JSON.
///
/// References render as their key; non-finite floats render as `null`.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Custom(json) => json.clone(),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Reference(key) => serde_json::Value::String(key.to_string()),
    }
}
