//! STRATA Core - Normalized Record Types
//!
//! Keys, values, records and the field-level merge engine, plus the key
//! resolver contract, cache headers and configuration shared by every other
//! STRATA crate. Nothing here performs I/O.

pub mod config;
pub mod error;
pub mod field;
pub mod headers;
pub mod key;
pub mod record;
pub mod resolver;
pub mod value;

pub use config::{CacheConfig, EvictionPolicy, LmdbConfig, ReadPopulation};
pub use error::{ConfigError, NormalizeError, StorageError, StrataError, StrataResult};
pub use field::{canonical_json, CompiledField, InputValue, Variables};
pub use headers::{CacheHeaders, Directives, DO_NOT_STORE, EVICT_AFTER_READ, MEMORY_CACHE_ONLY};
pub use key::{CacheKey, FieldPath, MUTATION_ROOT, QUERY_ROOT, SUBSCRIPTION_ROOT};
pub use record::{merge_records, Record};
pub use resolver::{DefaultKeyResolver, IdFieldKeyResolver, KeyResolver};
pub use value::Value;

use std::collections::BTreeSet;

/// Field paths changed by one or more merges.
pub type ChangeSet = BTreeSet<FieldPath>;
