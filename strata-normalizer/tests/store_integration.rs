//! End-to-end tests: responses normalized into a multi-tier chain and read
//! back out.

use std::sync::{Arc, Once};

use serde_json::json;
use strata_core::{
    CacheConfig, CacheHeaders, CacheKey, CompiledField, EvictionPolicy, IdFieldKeyResolver,
    LmdbConfig, ReadPopulation, Record, Variables,
};
use strata_normalizer::NormalizedStore;
use strata_storage::{CacheTier, LmdbTier, MemoryTier, TierChain, TierOptions};
use strata_test_utils::{assertions, fixtures, FailingTier};
use tempfile::TempDir;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn id_store(chain: TierChain) -> NormalizedStore {
    NormalizedStore::new(chain, Arc::new(IdFieldKeyResolver::default()))
}

#[tokio::test]
async fn test_response_round_trips_through_identity_keys() {
    init_tracing();
    let store = id_store(fixtures::memory_chain());
    let headers = CacheHeaders::none();

    let changed = store
        .write_response(
            &CacheKey::root(),
            &fixtures::hero_response(),
            &fixtures::hero_selection(),
            &Variables::new(),
            &headers,
        )
        .await
        .unwrap();
    assert!(changed
        .iter()
        .any(|path| path.key == CacheKey::new("Human:1000") && path.field == "name"));

    let read = store
        .read_response(&CacheKey::root(), &fixtures::hero_selection(), &Variables::new(), &headers)
        .await
        .unwrap()
        .expect("response should be readable");
    assert_eq!(read.data, fixtures::hero_response());
    let deps: Vec<&str> = read.dependent_keys.iter().map(CacheKey::as_str).collect();
    assert_eq!(deps, vec!["Droid:2001", "Human:1000", "Human:1002", "QUERY_ROOT"]);
}

#[tokio::test]
async fn test_second_response_reports_only_the_changed_field() {
    init_tracing();
    let store = id_store(fixtures::memory_chain());
    let headers = CacheHeaders::none();
    let selection = fixtures::hero_selection();
    store
        .write_response(&CacheKey::root(), &fixtures::hero_response(), &selection, &Variables::new(), &headers)
        .await
        .unwrap();

    let mut updated = fixtures::hero_response();
    updated["hero"]["friends"][1]["name"] = json!("Han");
    let changed = store
        .write_response(&CacheKey::root(), &updated, &selection, &Variables::new(), &headers)
        .await
        .unwrap();
    assertions::assert_changed_exactly(&changed, &["Human:1002.name"]);

    let again = store
        .write_response(&CacheKey::root(), &updated, &selection, &Variables::new(), &headers)
        .await
        .unwrap();
    assertions::assert_no_changes(&again);
}

#[tokio::test]
async fn test_partial_response_preserves_other_fields() {
    let store = id_store(fixtures::memory_chain());
    let headers = CacheHeaders::none();
    store
        .write_response(
            &CacheKey::root(),
            &fixtures::hero_response(),
            &fixtures::hero_selection(),
            &Variables::new(),
            &headers,
        )
        .await
        .unwrap();

    let selection = fixtures::user_by_id_selection();
    let variables = Variables::new().with("id", json!("Human:1000"));
    store
        .write_response(
            &CacheKey::root(),
            &json!({ "user": { "id": "Human:1000", "name": "Luke" } }),
            &selection,
            &variables,
            &headers,
        )
        .await
        .unwrap();

    let hero = store
        .read_record(&CacheKey::root(), &headers)
        .await
        .unwrap()
        .expect("root should exist");
    assert!(hero.has_field("hero"));
    assert!(hero.has_field("user({\"id\":\"Human:1000\"})"));

    let read = store
        .read_response(&CacheKey::root(), &selection, &variables, &headers)
        .await
        .unwrap()
        .expect("targeted read should hit");
    assert_eq!(read.data, json!({ "user": { "id": "Human:1000", "name": "Luke" } }));
}

#[tokio::test]
async fn test_cascading_removal_over_normalized_graph() {
    let store = id_store(fixtures::memory_chain());
    let headers = CacheHeaders::none();
    store
        .write_records(&fixtures::reference_graph(), &headers)
        .await
        .unwrap();

    assert!(store.remove(&CacheKey::root(), true).await.unwrap());
    let dump = store.dump().await.unwrap();
    let remaining: Vec<&str> = dump["memory"].keys().map(CacheKey::as_str).collect();
    assert_eq!(remaining, vec!["D"]);

    store.write_records(&fixtures::reference_cycle(), &headers).await.unwrap();
    assert!(store.remove(&CacheKey::new("B"), true).await.unwrap());
    assert!(!store.remove(&CacheKey::new("A"), true).await.unwrap());
}

#[tokio::test]
async fn test_bounded_memory_tier_falls_back_to_lmdb() {
    init_tracing();
    let temp_dir = TempDir::new().expect("TempDir creation should succeed");
    let memory = Arc::new(MemoryTier::new(EvictionPolicy::unbounded().with_max_entries(2)));
    let lmdb = Arc::new(
        LmdbTier::open(&LmdbConfig::new(temp_dir.path()).with_map_size_mb(10))
            .expect("lmdb should open"),
    );
    let chain = TierChain::new()
        .with_tier(memory.clone())
        .with_tier(lmdb.clone());
    let store = id_store(chain);
    let headers = CacheHeaders::none();

    let records: Vec<Record> = (1..=3)
        .map(|i| Record::new(CacheKey::new(format!("K{}", i))).with_field("v", i as i64))
        .collect();
    store.write_records(&records[..2], &headers).await.unwrap();
    assert!(store.read_record(&CacheKey::new("K1"), &headers).await.unwrap().is_some());
    store.write_records(&records[2..], &headers).await.unwrap();

    assert!(memory.load(&CacheKey::new("K2"), &headers).await.unwrap().is_none());
    assert_eq!(lmdb.len().await.unwrap(), 3);

    let k2 = store.read_record(&CacheKey::new("K2"), &headers).await.unwrap();
    assert_eq!(k2.as_ref(), Some(&records[1]));
    assert!(memory.load(&CacheKey::new("K2"), &headers).await.unwrap().is_some());
}

#[tokio::test]
async fn test_store_from_config_without_read_population() {
    let temp_dir = TempDir::new().expect("TempDir creation should succeed");
    let config = CacheConfig::default()
        .with_lmdb(LmdbConfig::new(temp_dir.path()).with_map_size_mb(10))
        .with_read_population(ReadPopulation::None);
    let store = NormalizedStore::from_config(&config, Arc::new(IdFieldKeyResolver::default()))
        .expect("store should build");
    assert_eq!(store.chain().tier_ids(), vec!["memory", "lmdb"]);

    let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
    store
        .write_records(&[record.clone()], &CacheHeaders::memory_cache_only())
        .await
        .unwrap();
    let dump = store.dump().await.unwrap();
    assert_eq!(dump["memory"].len(), 1);
    assert!(dump["lmdb"].is_empty());
}

#[tokio::test]
async fn test_evict_after_read_is_single_use_across_tiers() {
    let temp_dir = TempDir::new().expect("TempDir creation should succeed");
    let config = CacheConfig::default()
        .with_lmdb(LmdbConfig::new(temp_dir.path()).with_map_size_mb(10));
    let store = NormalizedStore::from_config(&config, Arc::new(IdFieldKeyResolver::default()))
        .expect("store should build");
    let record = Record::new(CacheKey::new("Token:1")).with_field("secret", "s3cr3t");
    store
        .write_records(&[record.clone()], &CacheHeaders::none())
        .await
        .unwrap();
    let dump = store.dump().await.unwrap();
    assert_eq!(dump["memory"].len(), 1);
    assert_eq!(dump["lmdb"].len(), 1);

    let first = store
        .read_record(record.key(), &CacheHeaders::evict_after_read())
        .await
        .unwrap();
    assert_eq!(first, Some(record.clone()));

    let second = store.read_record(record.key(), &CacheHeaders::none()).await.unwrap();
    assert!(second.is_none());
    let dump = store.dump().await.unwrap();
    assert!(dump["memory"].is_empty());
    assert!(dump["lmdb"].is_empty());
}

#[tokio::test]
async fn test_failing_persistent_tier() {
    init_tracing();
    let failing = Arc::new(FailingTier::new());
    let chain = TierChain::new()
        .with_tier(Arc::new(MemoryTier::unbounded()))
        .with_tier(failing.clone());
    let store = id_store(chain);
    let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);

    let result = store.write_records(&[record.clone()], &CacheHeaders::none()).await;
    assertions::assert_storage_error(&result);

    let miss = store
        .read_record(&CacheKey::new("missing"), &CacheHeaders::none())
        .await;
    assertions::assert_ok(&miss);
    assert!(failing.attempts() >= 2);

    let lenient = TierChain::new()
        .with_tier(Arc::new(MemoryTier::unbounded()))
        .with_tier_options(Arc::new(FailingTier::new()), TierOptions::lenient());
    let store = id_store(lenient);
    let changed = store.write_records(&[record], &CacheHeaders::none()).await.unwrap();
    assertions::assert_changed_exactly(&changed, &["K.v"]);
}

#[tokio::test]
async fn test_subscription_sees_normalized_changes() {
    let store = id_store(fixtures::memory_chain());
    let mut changes = store.subscribe();
    let selection = vec![CompiledField::new("viewer")
        .with_selections(vec![CompiledField::new("id"), CompiledField::new("status")])];

    store
        .write_response(
            &CacheKey::root(),
            &json!({ "viewer": { "id": "User:1", "status": "online" } }),
            &selection,
            &Variables::new(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();
    let first = changes.recv().await.unwrap();
    assertions::assert_changed_exactly(&first, &["QUERY_ROOT.viewer", "User:1.id", "User:1.status"]);

    store
        .write_response(
            &CacheKey::root(),
            &json!({ "viewer": { "id": "User:1", "status": "away" } }),
            &selection,
            &Variables::new(),
            &CacheHeaders::none(),
        )
        .await
        .unwrap();
    let second = changes.recv().await.unwrap();
    assertions::assert_changed_exactly(&second, &["User:1.status"]);
}
