//! The tier contract shared by every storage layer.
//!
//! A tier is one store in an ordered chain (fast in-memory first, slower
//! persistent stores after). Tiers only act on their own contents: falling
//! through to the next tier, write-through and cascading removal are the
//! chain's job. Implementations must be safe for concurrent use and must
//! apply a merge into one key atomically with respect to other operations on
//! that key.

use async_trait::async_trait;
use std::collections::BTreeMap;

use strata_core::{CacheHeaders, CacheKey, ChangeSet, Record, StrataResult};

/// Pluggable storage tier.
///
/// Tiers honor the directives that concern a single tier themselves:
/// `do-not-store` turns [`CacheTier::merge`] into a no-op and
/// `evict-after-read` makes a successful [`CacheTier::load`] remove the entry.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Identifier of this tier in diagnostic dumps.
    fn id(&self) -> &str;

    /// Load one record; `None` on miss.
    async fn load(&self, key: &CacheKey, headers: &CacheHeaders) -> StrataResult<Option<Record>>;

    /// Load several records. Misses are omitted from the result.
    async fn load_many(
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

    /// Merge a record into this tier and report the changed fields.
    async fn merge(&self, record: &Record, headers: &CacheHeaders) -> StrataResult<ChangeSet>;

    /// Remove one record, returning it if it was present.
    async fn remove(&self, key: &CacheKey) -> StrataResult<Option<Record>>;

    /// Remove every record.
    async fn clear(&self) -> StrataResult<()>;

    /// Snapshot of every live record, for inspection tooling.
    async fn dump(&self) -> StrataResult<BTreeMap<CacheKey, Record>>;

    /// Number of records currently held.
    async fn len(&self) -> StrataResult<u64>;

    /// Usage statistics.
    async fn stats(&self) -> StrataResult<TierStats>;
}

/// Statistics about tier usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Number of load hits.
    pub hits: u64,
    /// Number of load misses.
    pub misses: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
    /// Approximate weight of the held entries in bytes.
    pub size_bytes: u64,
    /// Number of entries dropped by eviction policy (bounds or expiry).
    pub evictions: u64,
}

impl TierStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_stats_hit_rate() {
        let stats = TierStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = TierStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
