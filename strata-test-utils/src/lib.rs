//! STRATA Test Utilities
//!
//! Centralized test infrastructure for the STRATA workspace:
//! - Proptest generators for keys, values, records and policies
//! - A failing tier for exercising chain failure modes
//! - Test fixtures for common response shapes
//! - Custom assertions for STRATA-specific validation

// Re-export core types for convenience
pub use strata_core::{
    CacheConfig, CacheHeaders, CacheKey, ChangeSet, CompiledField, ConfigError, EvictionPolicy,
    FieldPath, InputValue, NormalizeError, ReadPopulation, Record, StorageError, StrataError,
    StrataResult, Value, Variables,
};
pub use strata_storage::{CacheTier, MemoryTier, TierChain, TierStats};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// MOCK TIERS
// ============================================================================

/// Tier that fails every read and write, counting attempts.
#[derive(Debug, Default)]
pub struct FailingTier {
    attempts: AtomicU64,
}

impl FailingTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failed operations so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn fail<T>(&self, key: &str) -> StrataResult<T> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(StorageError::WriteFailed {
            tier: "failing".to_string(),
            key: key.to_string(),
            reason: "injected failure".to_string(),
        }
        .into())
    }
}

#[async_trait]
impl CacheTier for FailingTier {
    fn id(&self) -> &str {
        "failing"
    }

    async fn load(&self, key: &CacheKey, _headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        self.fail(key.as_str())
    }

    async fn merge(&self, record: &Record, _headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        self.fail(record.key().as_str())
    }

    async fn remove(&self, key: &CacheKey) -> StrataResult<Option<Record>> {
        self.fail(key.as_str())
    }

    async fn clear(&self) -> StrataResult<()> {
        self.fail("*")
    }

    async fn dump(&self) -> StrataResult<BTreeMap<CacheKey, Record>> {
        Ok(BTreeMap::new())
    }

    async fn len(&self) -> StrataResult<u64> {
        Ok(0)
    }

    async fn stats(&self) -> StrataResult<TierStats> {
        Ok(TierStats::default())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating STRATA types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a short `Type:id` style cache key.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        ("[A-Z][a-z]{0,6}", 0u32..64).prop_map(|(ty, id)| CacheKey::new(format!("{}:{}", ty, id)))
    }

    /// Generate a field name.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z0-9_]{0,8}"
    }

    /// Generate a scalar value (never a reference or list).
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9).prop_map(Value::Float),
            "[ -~]{0,16}".prop_map(Value::String),
            (0u32..100).prop_map(|n| Value::Custom(serde_json::json!({ "n": n }))),
        ]
    }

    /// Generate any value, including nested lists and references.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            4 => arb_scalar_value(),
            1 => arb_cache_key().prop_map(Value::Reference),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::List)
        })
    }

    /// Generate a record under `key`.
    pub fn arb_record_for(key: CacheKey) -> impl Strategy<Value = Record> {
        prop::collection::btree_map(arb_field_name(), arb_value(), 0..8)
            .prop_map(move |fields| Record::with_fields(key.clone(), fields))
    }

    /// Generate a record with a random key.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        arb_cache_key().prop_flat_map(arb_record_for)
    }

    /// Generate an eviction policy that passes validation.
    pub fn arb_eviction_policy() -> impl Strategy<Value = EvictionPolicy> {
        (
            prop::option::of(1u64..1_000_000),
            prop::option::of(1u64..10_000),
            prop::option::of(1u64..3600),
            prop::option::of(1u64..3600),
        )
            .prop_map(|(size, entries, access, write)| EvictionPolicy {
                max_size_bytes: size,
                max_entries: entries,
                expire_after_access: access.map(Duration::from_secs),
                expire_after_write: write.map(Duration::from_secs),
            })
    }

    /// Generate a memory-only config that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (arb_eviction_policy(), any::<bool>()).prop_map(|(memory, populate)| {
            CacheConfig::new()
                .with_memory_policy(memory)
                .with_read_population(if populate {
                    ReadPopulation::WriteBack
                } else {
                    ReadPopulation::None
                })
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Selection for `{ hero { id name friends { id name } } }`.
    pub fn hero_selection() -> Vec<CompiledField> {
        vec![CompiledField::new("hero").with_selections(vec![
            CompiledField::new("id"),
            CompiledField::new("name"),
            CompiledField::new("friends").with_selections(vec![
                CompiledField::new("id"),
                CompiledField::new("name"),
            ]),
        ])]
    }

    /// Response matching [`hero_selection`].
    pub fn hero_response() -> serde_json::Value {
        serde_json::json!({
            "hero": {
                "id": "Droid:2001",
                "name": "R2-D2",
                "friends": [
                    { "id": "Human:1000", "name": "Luke Skywalker" },
                    { "id": "Human:1002", "name": "Han Solo" }
                ]
            }
        })
    }

    /// Selection for `{ user(id: $id) { id name } }`.
    pub fn user_by_id_selection() -> Vec<CompiledField> {
        vec![CompiledField::new("user")
            .with_argument("id", InputValue::variable("id"))
            .with_selections(vec![CompiledField::new("id"), CompiledField::new("name")])]
    }

    /// A single-tier unbounded memory chain.
    pub fn memory_chain() -> TierChain {
        TierChain::new().with_tier(Arc::new(MemoryTier::unbounded()))
    }

    /// Records for the graph `QUERY_ROOT -> A, B` and `A -> C`, plus an
    /// unrelated `D`.
    pub fn reference_graph() -> Vec<Record> {
        vec![
            Record::new(CacheKey::root())
                .with_field("a", Value::Reference(CacheKey::new("A")))
                .with_field("b", Value::List(vec![Value::Reference(CacheKey::new("B"))])),
            Record::new(CacheKey::new("A")).with_field("c", Value::Reference(CacheKey::new("C"))),
            Record::new(CacheKey::new("B")).with_field("name", "b"),
            Record::new(CacheKey::new("C")).with_field("name", "c"),
            Record::new(CacheKey::new("D")).with_field("name", "d"),
        ]
    }

    /// Two records referencing each other.
    pub fn reference_cycle() -> Vec<Record> {
        vec![
            Record::new(CacheKey::new("A")).with_field("next", Value::Reference(CacheKey::new("B"))),
            Record::new(CacheKey::new("B")).with_field("next", Value::Reference(CacheKey::new("A"))),
        ]
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for STRATA-specific validation.

    use super::*;

    /// Assert that a StrataResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a StrataResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_normalize_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Normalize(_)) => {}
            other => panic!("Expected Normalize error, got: {:?}", other),
        }
    }

    /// Assert that a config passes validation.
    #[track_caller]
    pub fn assert_config_valid(config: &CacheConfig) {
        if let Err(e) = config.validate() {
            panic!("Config should be valid: {:?}", e);
        }
    }

    /// Assert that exactly the given `key.field` paths changed.
    #[track_caller]
    pub fn assert_changed_exactly(changed: &ChangeSet, expected: &[&str]) {
        let mut actual: Vec<String> = changed.iter().map(ToString::to_string).collect();
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        actual.sort();
        expected.sort();
        assert_eq!(actual, expected, "Changed field paths differ");
    }

    #[track_caller]
    pub fn assert_no_changes(changed: &ChangeSet) {
        assert!(changed.is_empty(), "Expected no changes, got: {:?}", changed);
    }

    /// Assert that a record references exactly `expected`, in order.
    #[track_caller]
    pub fn assert_references(record: &Record, expected: &[&str]) {
        let actual: Vec<CacheKey> = record.referenced_keys();
        let expected: Vec<CacheKey> = expected.iter().map(|k| CacheKey::new(*k)).collect();
        assert_eq!(actual, expected, "Wrong references from {}", record.key());
    }
}

// ============================================================================
// TESTS
// ============================================================================
