//! Bounded in-memory tier.
//!
//! Records live in a sharded [`DashMap`]. Every merge runs inside the entry
//! guard of its key, so concurrent merges into one key are serialized while
//! keys on other shards proceed independently. No await point exists inside
//! a guard.
//!
//! # Eviction
//!
//! Each access stamps the entry with a monotonically increasing tick. After
//! every write the tier drops expired entries (when a time bound is set) and
//! then evicts the entry with the lowest tick until the count and size bounds
//! hold again. A record heavier than `max_size_bytes` on its own is therefore
//! evicted right after being written. Eviction never follows references.
//!
//! Expiry is checked lazily; the tier runs no background task.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use strata_core::{
    merge_records, CacheHeaders, CacheKey, ChangeSet, Directives, EvictionPolicy, Record,
    StrataResult,
};

use crate::tier::{CacheTier, TierStats};

/// Default identifier of the memory tier in dumps.
pub const MEMORY_TIER_ID: &str = "memory";

#[derive(Debug)]
struct Entry {
    record: Record,
    weight: u64,
    written_at: Instant,
    accessed_at: Instant,
    tick: u64,
}

enum Lookup {
    Hit(Record),
    Expired,
    Miss,
}

/// In-memory tier with size, count and age bounds.
pub struct MemoryTier {
    id: String,
    policy: EvictionPolicy,
    entries: DashMap<CacheKey, Entry>,
    clock: AtomicU64,
    total_weight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self::with_id(MEMORY_TIER_ID, policy)
    }

    /// Create a tier that reports under a custom identifier.
    pub fn with_id(id: impl Into<String>, policy: EvictionPolicy) -> Self {
        Self {
            id: id.into(),
            policy,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            total_weight: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A tier without any bound.
    pub fn unbounded() -> Self {
        Self::new(EvictionPolicy::unbounded())
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Current aggregate weight of all entries.
    pub fn weight(&self) -> u64 {
        self.total_weight.load(Ordering::Acquire)
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel)
    }

    fn weigh(record: &Record) -> u64 {
        (record.key().size_in_bytes() + record.size_in_bytes()) as u64
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        if let Some(ttl) = self.policy.expire_after_write {
            if now.saturating_duration_since(entry.written_at) >= ttl {
                return true;
            }
        }
        if let Some(ttl) = self.policy.expire_after_access {
            if now.saturating_duration_since(entry.accessed_at) >= ttl {
                return true;
            }
        }
        false
    }

    fn has_time_bounds(&self) -> bool {
        self.policy.expire_after_write.is_some() || self.policy.expire_after_access.is_some()
    }

    fn over_bounds(&self) -> bool {
        let over_count = self
            .policy
            .max_entries
            .is_some_and(|max| self.entries.len() as u64 > max);
        let over_size = self
            .policy
            .max_size_bytes
            .is_some_and(|max| self.weight() > max);
        over_count || over_size
    }

    fn remove_entry(&self, key: &CacheKey) -> Option<Entry> {
        let (_, entry) = self.entries.remove(key)?;
        self.total_weight.fetch_sub(entry.weight, Ordering::AcqRel);
        Some(entry)
    }

    fn remove_if_expired(&self, key: &CacheKey, now: Instant) -> bool {
        match self.entries.remove_if(key, |_, entry| self.is_expired(entry, now)) {
            Some((_, entry)) => {
                self.total_weight.fetch_sub(entry.weight, Ordering::AcqRel);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, key: &CacheKey, now: Instant) -> Lookup {
        match self.entries.get_mut(key) {
            None => Lookup::Miss,
            Some(mut entry) => {
                if self.is_expired(&entry, now) {
                    Lookup::Expired
                } else {
                    entry.accessed_at = now;
                    entry.tick = self.next_tick();
                    Lookup::Hit(entry.record.clone())
                }
            }
        }
    }

    /// Remove and return a live entry under one shard guard, so a merge
    /// racing the read is either returned or left in place.
    fn take(&self, key: &CacheKey, now: Instant) -> Lookup {
        if let Some((_, entry)) = self
            .entries
            .remove_if(key, |_, entry| !self.is_expired(entry, now))
        {
            self.total_weight.fetch_sub(entry.weight, Ordering::AcqRel);
            return Lookup::Hit(entry.record);
        }
        if self.entries.contains_key(key) {
            Lookup::Expired
        } else {
            Lookup::Miss
        }
    }

    /// Drop expired entries, then evict least recently used entries until
    /// every bound holds.
    fn enforce_bounds(&self, now: Instant) {
        if self.has_time_bounds() {
            let expired: Vec<CacheKey> = self
                .entries
                .iter()
                .filter(|entry| self.is_expired(entry.value(), now))
                .map(|entry| entry.key().clone())
                .collect();
            for key in expired {
                if self.remove_if_expired(&key, now) {
                    tracing::debug!(tier = %self.id, key = %key, "expired record");
                }
            }
        }

        while self.over_bounds() {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().tick)
                .map(|entry| entry.key().clone());
            let Some(key) = victim else {
                break;
            };
            if let Some(entry) = self.remove_entry(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tier = %self.id,
                    key = %key,
                    weight = entry.weight,
                    "evicted least recently used record"
                );
            }
        }
    }

    fn merge_now(&self, record: &Record, now: Instant) -> ChangeSet {
        let tick = self.next_tick();
        let changed = match self.entries.entry(record.key().clone()) {
            MapEntry::Occupied(mut occupied) => {
                let expired = self.is_expired(occupied.get(), now);
                let entry = occupied.get_mut();
                let changed = if expired {
                    let (fresh, changed) = merge_records(None, record);
                    entry.record = fresh;
                    changed
                } else {
                    entry.record.merge_in_place(record)
                };
                let weight = Self::weigh(&entry.record);
                if weight >= entry.weight {
                    self.total_weight
                        .fetch_add(weight - entry.weight, Ordering::AcqRel);
                } else {
                    self.total_weight
                        .fetch_sub(entry.weight - weight, Ordering::AcqRel);
                }
                entry.weight = weight;
                entry.written_at = now;
                entry.accessed_at = now;
                entry.tick = tick;
                changed
            }
            MapEntry::Vacant(vacant) => {
                let (fresh, changed) = merge_records(None, record);
                let weight = Self::weigh(&fresh);
                self.total_weight.fetch_add(weight, Ordering::AcqRel);
                vacant.insert(Entry {
                    record: fresh,
                    weight,
                    written_at: now,
                    accessed_at: now,
                    tick,
                });
                changed
            }
        };
        self.enforce_bounds(now);
        changed
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load(&self, key: &CacheKey, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        let now = Instant::now();
        let lookup = if headers.directives().contains(Directives::EVICT_AFTER_READ) {
            self.take(key, now)
        } else {
            self.lookup(key, now)
        };
        match lookup {
            Lookup::Hit(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(record))
            }
            Lookup::Expired => {
                self.remove_if_expired(key, now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Lookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn merge(&self, record: &Record, headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        if headers.directives().contains(Directives::DO_NOT_STORE) {
            return Ok(ChangeSet::new());
        }
        Ok(self.merge_now(record, Instant::now()))
    }

    async fn remove(&self, key: &CacheKey) -> StrataResult<Option<Record>> {
        Ok(self.remove_entry(key).map(|entry| entry.record))
    }

    async fn clear(&self) -> StrataResult<()> {
        self.entries.retain(|_, entry| {
            self.total_weight.fetch_sub(entry.weight, Ordering::AcqRel);
            false
        });
        Ok(())
    }

    async fn dump(&self) -> StrataResult<BTreeMap<CacheKey, Record>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !self.is_expired(entry.value(), now))
            .map(|entry| (entry.key().clone(), entry.value().record.clone()))
            .collect())
    }

    async fn len(&self) -> StrataResult<u64> {
        Ok(self.entries.len() as u64)
    }

    async fn stats(&self) -> StrataResult<TierStats> {
        Ok(TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            size_bytes: self.weight(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
