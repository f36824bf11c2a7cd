//! Ordered chain of cache tiers.
//!
//! The chain owns its tiers fast to slow and walks them iteratively. It is
//! the only place that knows about more than one tier: fallthrough on miss,
//! read population, write-through and cascading removal all live here.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use strata_core::{
    CacheConfig, CacheHeaders, CacheKey, ChangeSet, Directives, ReadPopulation, Record,
    StrataError, StrataResult,
};

use crate::lmdb::LmdbTier;
use crate::memory::MemoryTier;
use crate::tier::{CacheTier, TierStats};

/// What the chain does when a tier operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Return the error to the caller.
    Propagate,
    /// Log the error and carry on as if the tier missed (reads) or was
    /// skipped (writes).
    DegradeToMiss,
}

/// Per-tier failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierOptions {
    pub on_read_error: FailureMode,
    pub on_write_error: FailureMode,
}

impl Default for TierOptions {
    fn default() -> Self {
        Self {
            on_read_error: FailureMode::DegradeToMiss,
            on_write_error: FailureMode::Propagate,
        }
    }
}

impl TierOptions {
    /// Every failure is returned to the caller.
    pub fn strict() -> Self {
        Self {
            on_read_error: FailureMode::Propagate,
            on_write_error: FailureMode::Propagate,
        }
    }

    /// Every failure is logged and skipped.
    pub fn lenient() -> Self {
        Self {
            on_read_error: FailureMode::DegradeToMiss,
            on_write_error: FailureMode::DegradeToMiss,
        }
    }
}

struct TierSlot {
    tier: Arc<dyn CacheTier>,
    options: TierOptions,
}

impl TierSlot {
    /// Apply the write failure mode: `Ok(None)` means degraded.
    fn on_write<T>(&self, result: StrataResult<T>, operation: &str) -> StrataResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => match self.options.on_write_error {
                FailureMode::Propagate => Err(error),
                FailureMode::DegradeToMiss => {
                    self.degraded(&error, operation);
                    Ok(None)
                }
            },
        }
    }

    fn degraded(&self, error: &StrataError, operation: &str) {
        tracing::warn!(
            tier = %self.tier.id(),
            operation,
            error = %error,
            "tier operation failed, continuing without it"
        );
    }
}

/// Ordered list of tiers, fastest first.
pub struct TierChain {
    tiers: Vec<TierSlot>,
    read_population: ReadPopulation,
}

impl Default for TierChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TierChain {
    /// An empty chain. Every load misses until a tier is added.
    pub fn new() -> Self {
        Self {
            tiers: Vec::new(),
            read_population: ReadPopulation::WriteBack,
        }
    }

    /// Build the memory tier, plus the LMDB tier when configured.
    pub fn from_config(config: &CacheConfig) -> StrataResult<Self> {
        config.validate()?;
        let mut chain = Self::new()
            .with_read_population(config.read_population)
            .with_tier(Arc::new(MemoryTier::new(config.memory.clone())));
        if let Some(lmdb) = &config.lmdb {
            chain = chain.with_tier(Arc::new(LmdbTier::open(lmdb)?));
        }
        Ok(chain)
    }

    /// Append a tier with default failure handling.
    pub fn with_tier(self, tier: Arc<dyn CacheTier>) -> Self {
        self.with_tier_options(tier, TierOptions::default())
    }

    /// Append a tier below the existing ones.
    pub fn with_tier_options(mut self, tier: Arc<dyn CacheTier>, options: TierOptions) -> Self {
        self.tiers.push(TierSlot { tier, options });
        self
    }

    pub fn with_read_population(mut self, population: ReadPopulation) -> Self {
        self.read_population = population;
        self
    }

    pub fn read_population(&self) -> ReadPopulation {
        self.read_population
    }

    /// Identifiers of the tiers, in chain order.
    pub fn tier_ids(&self) -> Vec<&str> {
        self.tiers.iter().map(|slot| slot.tier.id()).collect()
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Tiers an operation under `headers` may touch.
    fn scoped(&self, headers: &CacheHeaders) -> &[TierSlot] {
        if headers.directives().contains(Directives::MEMORY_CACHE_ONLY) {
            &self.tiers[..self.tiers.len().min(1)]
        } else {
            &self.tiers
        }
    }

    /// Load a record, falling through tiers until one hits.
    pub async fn load(&self, key: &CacheKey, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        let tiers = self.scoped(headers);
        for (index, slot) in tiers.iter().enumerate() {
            let found = match slot.tier.load(key, headers).await {
                Ok(found) => found,
                Err(error) => match slot.options.on_read_error {
                    FailureMode::Propagate => return Err(error),
                    FailureMode::DegradeToMiss => {
                        slot.degraded(&error, "load");
                        None
                    }
                },
            };

            if let Some(record) = found {
                let evicting = headers.directives().contains(Directives::EVICT_AFTER_READ);
                if evicting {
                    Self::evict_below(&tiers[index + 1..], key).await?;
                } else if index > 0 && self.read_population == ReadPopulation::WriteBack {
                    Self::populate(&tiers[..index], &record).await;
                }
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Drop the write-through copies of a record consumed by an
    /// evict-after-read hit, so the next load misses.
    async fn evict_below(lower: &[TierSlot], key: &CacheKey) -> StrataResult<()> {
        for slot in lower {
            let result = slot.tier.remove(key).await;
            slot.on_write(result, "evict")?;
        }
        Ok(())
    }

    /// Copy a lower-tier hit into the tiers above it. Failures only log.
    async fn populate(upper: &[TierSlot], record: &Record) {
        let headers = CacheHeaders::none();
        for slot in upper {
            if let Err(error) = slot.tier.merge(record, &headers).await {
                slot.degraded(&error, "populate");
            }
        }
    }

    /// Load several records. Misses are omitted.
    pub async fn load_many(
        &self,
        keys: &[CacheKey],
        headers: &CacheHeaders,
    ) -> StrataResult<BTreeMap<CacheKey, Record>> {
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(record) = self.load(key, headers).await? {
                found.insert(key.clone(), record);
            }
        }
        Ok(found)
    }

    /// Write a record through every tier and report the union of changed
    /// fields.
    pub async fn merge(&self, record: &Record, headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        let mut changed = ChangeSet::new();
        if headers.directives().contains(Directives::DO_NOT_STORE) {
            return Ok(changed);
        }
        for slot in self.scoped(headers) {
            let result = slot.tier.merge(record, headers).await;
            if let Some(tier_changed) = slot.on_write(result, "merge")? {
                changed.extend(tier_changed);
            }
        }
        Ok(changed)
    }

    /// Merge a batch of records. There is no ordering guarantee across keys.
    pub async fn merge_many<'a, I>(&self, records: I, headers: &CacheHeaders) -> StrataResult<ChangeSet>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut changed = ChangeSet::new();
        if headers.directives().contains(Directives::DO_NOT_STORE) {
            return Ok(changed);
        }
        for record in records {
            changed.extend(self.merge(record, headers).await?);
        }
        Ok(changed)
    }

    /// Remove a key from every tier.
    ///
    /// With `cascade`, every record referenced by a removed copy is removed
    /// too, transitively. Each key is visited at most once per call, so
    /// cyclic graphs terminate. Returns whether anything was removed.
    pub async fn remove(&self, key: &CacheKey, cascade: bool) -> StrataResult<bool> {
        let mut removed_any = false;
        let mut visited: HashSet<CacheKey> = HashSet::new();
        let mut queue: VecDeque<CacheKey> = VecDeque::new();
        visited.insert(key.clone());
        queue.push_back(key.clone());

        while let Some(current) = queue.pop_front() {
            for slot in &self.tiers {
                let result = slot.tier.remove(&current).await;
                let Some(Some(record)) = slot.on_write(result, "remove")? else {
                    continue;
                };
                removed_any = true;
                if !cascade {
                    continue;
                }
                for referenced in record.referenced_keys() {
                    if visited.insert(referenced.clone()) {
                        tracing::debug!(
                            tier = %slot.tier.id(),
                            from = %current,
                            key = %referenced,
                            "cascading removal"
                        );
                        queue.push_back(referenced);
                    }
                }
            }
        }
        Ok(removed_any)
    }

    /// Clear every tier.
    pub async fn clear(&self) -> StrataResult<()> {
        for slot in &self.tiers {
            let result = slot.tier.clear().await;
            slot.on_write(result, "clear")?;
        }
        Ok(())
    }

    /// Snapshot of every tier's records, keyed by tier id.
    pub async fn dump(&self) -> StrataResult<BTreeMap<String, BTreeMap<CacheKey, Record>>> {
        let mut dumps = BTreeMap::new();
        for slot in &self.tiers {
            dumps.insert(slot.tier.id().to_string(), slot.tier.dump().await?);
        }
        Ok(dumps)
    }

    /// Statistics of every tier, keyed by tier id.
    pub async fn stats(&self) -> StrataResult<BTreeMap<String, TierStats>> {
        let mut stats = BTreeMap::new();
        for slot in &self.tiers {
            stats.insert(slot.tier.id().to_string(), slot.tier.stats().await?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strata_core::{EvictionPolicy, LmdbConfig, StorageError, Value};
    use tempfile::TempDir;

    /// Tier whose every operation fails.
    struct BrokenTier;

    fn broken(key: &CacheKey) -> StrataError {
        StorageError::ReadFailed {
            tier: "broken".to_string(),
            key: key.to_string(),
            reason: "disk on fire".to_string(),
        }
        .into()
    }

    #[async_trait]
    impl CacheTier for BrokenTier {
        fn id(&self) -> &str {
            "broken"
        }

        async fn load(&self, key: &CacheKey, _headers: &CacheHeaders) -> StrataResult<Option<Record>> {
            Err(broken(key))
        }

        async fn merge(&self, record: &Record, _headers: &CacheHeaders) -> StrataResult<ChangeSet> {
            Err(broken(record.key()))
        }

        async fn remove(&self, key: &CacheKey) -> StrataResult<Option<Record>> {
            Err(broken(key))
        }

        async fn clear(&self) -> StrataResult<()> {
            Err(broken(&CacheKey::new("*")))
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

    fn reference(key: &str) -> Value {
        Value::Reference(CacheKey::new(key))
    }

    fn two_memory_tiers() -> (TierChain, Arc<MemoryTier>, Arc<MemoryTier>) {
        let upper = Arc::new(MemoryTier::with_id("upper", EvictionPolicy::unbounded()));
        let lower = Arc::new(MemoryTier::with_id("lower", EvictionPolicy::unbounded()));
        let chain = TierChain::new()
            .with_tier(upper.clone())
            .with_tier(lower.clone());
        (chain, upper, lower)
    }

    async fn seed_graph(chain: &TierChain) {
        let headers = CacheHeaders::none();
        let records = vec![
            Record::new(CacheKey::root()).with_field("a", reference("A")).with_field(
                "list",
                Value::List(vec![reference("B")]),
            ),
            Record::new(CacheKey::new("A")).with_field("c", reference("C")),
            Record::new(CacheKey::new("B")).with_field("name", "b"),
            Record::new(CacheKey::new("C")).with_field("name", "c"),
            Record::new(CacheKey::new("D")).with_field("name", "d"),
        ];
        chain.merge_many(&records, &headers).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_chain_misses() {
        let chain = TierChain::new();
        let loaded = chain
            .load(&CacheKey::new("A"), &CacheHeaders::none())
            .await
            .unwrap();
        assert!(loaded.is_none());
        assert!(!chain.remove(&CacheKey::new("A"), true).await.unwrap());
    }

    #[tokio::test]
    async fn test_lower_hit_populates_upper_tier() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        lower.merge(&record, &CacheHeaders::none()).await.unwrap();

        let loaded = chain.load(record.key(), &CacheHeaders::none()).await.unwrap();
        assert_eq!(loaded, Some(record.clone()));
        assert_eq!(
            upper.load(record.key(), &CacheHeaders::none()).await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn test_no_population_when_disabled() {
        let (chain, upper, lower) = two_memory_tiers();
        let chain = chain.with_read_population(ReadPopulation::None);
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        lower.merge(&record, &CacheHeaders::none()).await.unwrap();

        assert!(chain.load(record.key(), &CacheHeaders::none()).await.unwrap().is_some());
        assert_eq!(upper.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_after_read_does_not_populate() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        lower.merge(&record, &CacheHeaders::none()).await.unwrap();

        let loaded = chain
            .load(record.key(), &CacheHeaders::evict_after_read())
            .await
            .unwrap();
        assert!(loaded.is_some());
        assert_eq!(upper.len().await.unwrap(), 0);
        assert_eq!(lower.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_after_read_consumes_every_copy() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        chain.merge(&record, &CacheHeaders::none()).await.unwrap();
        assert_eq!(lower.len().await.unwrap(), 1);

        let first = chain
            .load(record.key(), &CacheHeaders::evict_after_read())
            .await
            .unwrap();
        assert_eq!(first, Some(record.clone()));
        assert_eq!(upper.len().await.unwrap(), 0);
        assert_eq!(lower.len().await.unwrap(), 0);

        let second = chain.load(record.key(), &CacheHeaders::none()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_merge_writes_every_tier() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        let changed = chain.merge(&record, &CacheHeaders::none()).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(upper.len().await.unwrap(), 1);
        assert_eq!(lower.len().await.unwrap(), 1);

        let again = chain.merge(&record, &CacheHeaders::none()).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_do_not_store_touches_no_tier() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        let changed = chain.merge(&record, &CacheHeaders::do_not_store()).await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(upper.len().await.unwrap() + lower.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_cache_only_confines_to_first_tier() {
        let (chain, upper, lower) = two_memory_tiers();
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        chain
            .merge(&record, &CacheHeaders::memory_cache_only())
            .await
            .unwrap();
        assert_eq!(upper.len().await.unwrap(), 1);
        assert_eq!(lower.len().await.unwrap(), 0);

        let other = Record::new(CacheKey::new("L")).with_field("v", 2i64);
        lower.merge(&other, &CacheHeaders::none()).await.unwrap();
        let loaded = chain
            .load(other.key(), &CacheHeaders::memory_cache_only())
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_cascading_removal_follows_references() {
        let (chain, upper, lower) = two_memory_tiers();
        seed_graph(&chain).await;

        assert!(chain.remove(&CacheKey::root(), true).await.unwrap());
        for tier in [&upper, &lower] {
            let remaining = tier.dump().await.unwrap();
            assert_eq!(remaining.keys().cloned().collect::<Vec<_>>(), vec![CacheKey::new("D")]);
        }
    }

    #[tokio::test]
    async fn test_plain_removal_leaves_references() {
        let (chain, _upper, lower) = two_memory_tiers();
        seed_graph(&chain).await;

        assert!(chain.remove(&CacheKey::new("A"), false).await.unwrap());
        assert!(!chain.remove(&CacheKey::new("A"), false).await.unwrap());
        assert!(lower.load(&CacheKey::new("C"), &CacheHeaders::none()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cascade_terminates_on_cycles() {
        let (chain, upper, _lower) = two_memory_tiers();
        let headers = CacheHeaders::none();
        chain
            .merge(&Record::new(CacheKey::new("A")).with_field("next", reference("B")), &headers)
            .await
            .unwrap();
        chain
            .merge(&Record::new(CacheKey::new("B")).with_field("next", reference("A")), &headers)
            .await
            .unwrap();

        assert!(chain.remove(&CacheKey::new("A"), true).await.unwrap());
        assert_eq!(upper.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_read_degrades_to_next_tier() {
        let memory = Arc::new(MemoryTier::unbounded());
        let chain = TierChain::new()
            .with_tier(Arc::new(BrokenTier))
            .with_tier(memory.clone());
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        memory.merge(&record, &CacheHeaders::none()).await.unwrap();

        let loaded = chain.load(record.key(), &CacheHeaders::none()).await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn test_failure_modes_for_writes() {
        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);

        let strict = TierChain::new()
            .with_tier(Arc::new(MemoryTier::unbounded()))
            .with_tier(Arc::new(BrokenTier));
        assert!(matches!(
            strict.merge(&record, &CacheHeaders::none()).await,
            Err(StrataError::Storage(StorageError::ReadFailed { .. }))
        ));

        let lenient = TierChain::new()
            .with_tier(Arc::new(MemoryTier::unbounded()))
            .with_tier_options(Arc::new(BrokenTier), TierOptions::lenient());
        let changed = lenient.merge(&record, &CacheHeaders::none()).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert!(lenient.remove(record.key(), true).await.unwrap());
        assert!(lenient.clear().await.is_ok());

        let loud = TierChain::new().with_tier_options(Arc::new(BrokenTier), TierOptions::strict());
        assert!(loud.load(record.key(), &CacheHeaders::none()).await.is_err());
    }

    #[tokio::test]
    async fn test_from_config_with_lmdb() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::default().with_lmdb(LmdbConfig::new(temp_dir.path()).with_map_size_mb(10));
        let chain = TierChain::from_config(&config).expect("chain should build");
        assert_eq!(chain.tier_ids(), vec!["memory", "lmdb"]);

        let record = Record::new(CacheKey::new("K")).with_field("v", 1i64);
        chain.merge(&record, &CacheHeaders::none()).await.unwrap();
        let dump = chain.dump().await.unwrap();
        assert_eq!(dump["memory"].len(), 1);
        assert_eq!(dump["lmdb"].len(), 1);

        let stats = chain.stats().await.unwrap();
        assert_eq!(stats["lmdb"].entry_count, 1);
    }
}
