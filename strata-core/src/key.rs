//! Cache keys and field paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of the synthetic record holding a query's root fields.
pub const QUERY_ROOT: &str = "QUERY_ROOT";
/// Key of the synthetic record holding a mutation's root fields.
pub const MUTATION_ROOT: &str = "MUTATION_ROOT";
/// Key of the synthetic record holding a subscription's root fields.
pub const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";

/// Opaque identifier naming exactly one record.
///
/// The cache never interprets the structure of a key. Keys come either from a
/// [`KeyResolver`](crate::KeyResolver) or from the structural path of an
/// object inside a response tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The root key for query operations.
    pub fn root() -> Self {
        Self(QUERY_ROOT.to_string())
    }

    pub fn mutation_root() -> Self {
        Self(MUTATION_ROOT.to_string())
    }

    pub fn subscription_root() -> Self {
        Self(SUBSCRIPTION_ROOT.to_string())
    }

    /// Whether this key is one of the reserved operation roots.
    pub fn is_root(&self) -> bool {
        matches!(
            self.0.as_str(),
            QUERY_ROOT | MUTATION_ROOT | SUBSCRIPTION_ROOT
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Size of the key in bytes, as counted by size-bounded eviction.
    pub fn size_in_bytes(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One field of one record, the unit of change reporting.
///
/// Displays as `key.field`, which is the form dependent queries are
/// invalidated by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    pub key: CacheKey,
    pub field: String,
}

impl FieldPath {
    pub fn new(key: CacheKey, field: impl Into<String>) -> Self {
        Self {
            key,
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.field)
    }
}
