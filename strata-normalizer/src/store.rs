//! Normalized store facade.
//!
//! [`NormalizedStore`] ties the pieces together: responses are normalized,
//! merged through the tier chain, and the resulting [`ChangeSet`] is
//! broadcast to subscribers so dependent queries can be invalidated. Reads
//! go through the [`Reader`] and report which records they depended on.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use strata_core::{
    CacheConfig, CacheHeaders, CacheKey, ChangeSet, CompiledField, KeyResolver, Record,
    StrataResult, Variables,
};
use strata_storage::{TierChain, TierStats};

use crate::normalizer::{Normalizer, RecordBatch};
use crate::reader::{ReadResult, Reader};

/// Capacity of the change broadcast. Subscribers lagging further behind
/// observe `RecvError::Lagged`.
pub const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Normalizing cache over a [`TierChain`].
pub struct NormalizedStore {
    chain: Arc<TierChain>,
    normalizer: Normalizer,
    reader: Reader,
    changes: broadcast::Sender<ChangeSet>,
}

impl NormalizedStore {
    pub fn new(chain: TierChain, resolver: Arc<dyn KeyResolver>) -> Self {
        let chain = Arc::new(chain);
        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_CAPACITY);
        Self {
            normalizer: Normalizer::new(Arc::clone(&resolver)),
            reader: Reader::new(Arc::clone(&chain), resolver),
            chain,
            changes,
        }
    }

    /// Build the tiers described by `config`.
    pub fn from_config(config: &CacheConfig, resolver: Arc<dyn KeyResolver>) -> StrataResult<Self> {
        Ok(Self::new(TierChain::from_config(config)?, resolver))
    }

    pub fn chain(&self) -> &TierChain {
        &self.chain
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Receive the changed fields of every later write.
    ///
    /// Writes that change nothing are not broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }

    /// Normalize a response and merge it into every tier.
    pub async fn write_response(
        &self,
        root: &CacheKey,
        data: &serde_json::Value,
        selections: &[CompiledField],
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> StrataResult<ChangeSet> {
        let batch = self.normalizer.normalize(root, data, selections, variables)?;
        self.write_batch(&batch, headers).await
    }

    /// Merge an already normalized batch.
    pub async fn write_batch(&self, batch: &RecordBatch, headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        let changed = self.chain.merge_many(batch.records(), headers).await?;
        tracing::debug!(
            root = %batch.root,
            records = batch.len(),
            changed = changed.len(),
            "wrote response"
        );
        self.publish(&changed);
        Ok(changed)
    }

    /// Merge records built by hand.
    pub async fn write_records(&self, records: &[Record], headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        let changed = self.chain.merge_many(records, headers).await?;
        self.publish(&changed);
        Ok(changed)
    }

    /// Rebuild the response for `selections` from the cache.
    pub async fn read_response(
        &self,
        root: &CacheKey,
        selections: &[CompiledField],
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> StrataResult<Option<ReadResult>> {
        self.reader.read(root, selections, variables, headers).await
    }

    pub async fn read_record(&self, key: &CacheKey, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        self.chain.load(key, headers).await
    }

    pub async fn read_records(
        &self,
        keys: &[CacheKey],
        headers: &CacheHeaders,
    ) -> StrataResult<BTreeMap<CacheKey, Record>> {
        self.chain.load_many(keys, headers).await
    }

    pub async fn remove(&self, key: &CacheKey, cascade: bool) -> StrataResult<bool> {
        self.chain.remove(key, cascade).await
    }

    pub async fn clear(&self) -> StrataResult<()> {
        self.chain.clear().await
    }

    pub async fn dump(&self) -> StrataResult<BTreeMap<String, BTreeMap<CacheKey, Record>>> {
        self.chain.dump().await
    }

    pub async fn stats(&self) -> StrataResult<BTreeMap<String, TierStats>> {
        self.chain.stats().await
    }

    fn publish(&self, changed: &ChangeSet) {
        if changed.is_empty() {
            return;
        }
        // No receivers is not an error.
        let _ = self.changes.send(changed.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{DefaultKeyResolver, FieldPath};
    use strata_storage::MemoryTier;

    fn store() -> NormalizedStore {
        let chain = TierChain::new().with_tier(Arc::new(MemoryTier::unbounded()));
        NormalizedStore::new(chain, Arc::new(DefaultKeyResolver))
    }

    #[tokio::test]
    async fn test_subscribers_see_changed_fields_only() {
        let store = store();
        let mut changes = store.subscribe();
        let selection = vec![CompiledField::new("count")];
        let headers = CacheHeaders::none();

        store
            .write_response(&CacheKey::root(), &json!({ "count": 1 }), &selection, &Variables::new(), &headers)
            .await
            .unwrap();
        store
            .write_response(&CacheKey::root(), &json!({ "count": 1 }), &selection, &Variables::new(), &headers)
            .await
            .unwrap();
        store
            .write_response(&CacheKey::root(), &json!({ "count": 2 }), &selection, &Variables::new(), &headers)
            .await
            .unwrap();

        let expected: ChangeSet = [FieldPath::new(CacheKey::root(), "count")].into_iter().collect();
        assert_eq!(changes.recv().await.unwrap(), expected);
        assert_eq!(changes.recv().await.unwrap(), expected);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_do_not_store_publishes_nothing() {
        let store = store();
        let mut changes = store.subscribe();
        let changed = store
            .write_records(
                &[Record::new(CacheKey::new("A")).with_field("x", 1i64)],
                &CacheHeaders::do_not_store(),
            )
            .await
            .unwrap();
        assert!(changed.is_empty());
        assert!(changes.try_recv().is_err());
        assert!(store
            .read_record(&CacheKey::new("A"), &CacheHeaders::none())
            .await
            .unwrap()
            .is_none());
    }
}
