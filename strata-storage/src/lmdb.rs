//! LMDB-backed persistent tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep records in a
//! memory-mapped key-value store that survives restarts.
//!
//! # Layout
//!
//! The unnamed database maps the raw UTF-8 [`CacheKey`] to
//! `[written_at millis: 8 bytes LE][json record]`. The `written_at` database
//! indexes the same keys as `[written_at: 8 bytes BE, sign-flipped][key]`
//! with an empty value, so its iteration order is oldest write first.
//!
//! # Atomicity
//!
//! Every merge, removal and consuming read is a single write transaction.
//! LMDB serializes writers, so two operations on one key never interleave.
//! Transactions are opened and committed inside synchronous helpers and
//! never held across an await point.
//!
//! # Bounds
//!
//! The tier honors `max_entries` (oldest write evicted first) and
//! `expire_after_write`. Both walk the index from its oldest end and stop at
//! the first entry that stays, so a write only pays for what it evicts. Size
//! and idle-time bounds need per-read bookkeeping LMDB does not keep cheaply,
//! so [`LmdbTier::open`] rejects them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use strata_core::{
    merge_records, CacheHeaders, CacheKey, ChangeSet, ConfigError, Directives, EvictionPolicy,
    LmdbConfig, Record, StorageError, StrataError, StrataResult,
};

use crate::tier::{CacheTier, TierStats};

/// Default identifier of the LMDB tier in dumps.
pub const LMDB_TIER_ID: &str = "lmdb";

const TIMESTAMP_LEN: usize = 8;
const INDEX_DB_NAME: &str = "written_at";
const SIGN_BIT: u64 = 1 << 63;
const EMPTY: &[u8] = &[];

/// Error type for LMDB tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbTierError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Deserialization error.
    #[error("Deserialization error for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbTierError> for StrataError {
    fn from(e: LmdbTierError) -> Self {
        let tier = LMDB_TIER_ID.to_string();
        let error = match e {
            LmdbTierError::EnvOpen(reason) | LmdbTierError::DbOpen(reason) => {
                StorageError::OpenFailed { tier, reason }
            }
            LmdbTierError::Io(io) => StorageError::OpenFailed {
                tier,
                reason: io.to_string(),
            },
            LmdbTierError::Serialization { key, reason }
            | LmdbTierError::Deserialization { key, reason } => {
                StorageError::Encoding { key, reason }
            }
            LmdbTierError::Transaction(reason) => StorageError::TransactionFailed { tier, reason },
        };
        StrataError::Storage(error)
    }
}

fn txn_error(e: heed::Error) -> LmdbTierError {
    LmdbTierError::Transaction(e.to_string())
}

fn corrupt(key: &[u8], reason: impl Into<String>) -> LmdbTierError {
    LmdbTierError::Deserialization {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.into(),
    }
}

struct Stored {
    written_at: i64,
    record: Record,
}

fn encode(record: &Record, written_at: i64) -> Result<Vec<u8>, LmdbTierError> {
    let value_bytes = serde_json::to_vec(record).map_err(|e| LmdbTierError::Serialization {
        key: record.key().to_string(),
        reason: e.to_string(),
    })?;
    let mut full_bytes = Vec::with_capacity(TIMESTAMP_LEN + value_bytes.len());
    full_bytes.extend_from_slice(&written_at.to_le_bytes());
    full_bytes.extend_from_slice(&value_bytes);
    Ok(full_bytes)
}

fn timestamp_prefix(bytes: &[u8]) -> Option<[u8; TIMESTAMP_LEN]> {
    bytes.get(..TIMESTAMP_LEN).and_then(|slice| slice.try_into().ok())
}

fn decode(key: &[u8], bytes: &[u8]) -> Result<Stored, LmdbTierError> {
    let timestamp = timestamp_prefix(bytes).ok_or_else(|| corrupt(key, "Invalid timestamp"))?;
    let record: Record = serde_json::from_slice(&bytes[TIMESTAMP_LEN..])
        .map_err(|e| corrupt(key, e.to_string()))?;
    Ok(Stored {
        written_at: i64::from_le_bytes(timestamp),
        record,
    })
}

/// Index key ordered by write time. Flipping the sign bit makes the
/// big-endian bytes of an `i64` sort numerically.
fn index_key(written_at: i64, key: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(TIMESTAMP_LEN + key.len());
    bytes.extend_from_slice(&((written_at as u64) ^ SIGN_BIT).to_be_bytes());
    bytes.extend_from_slice(key);
    bytes
}

fn split_index_key(bytes: &[u8]) -> Result<(i64, &[u8]), LmdbTierError> {
    let timestamp = timestamp_prefix(bytes).ok_or_else(|| corrupt(bytes, "Invalid index entry"))?;
    let written_at = (u64::from_be_bytes(timestamp) ^ SIGN_BIT) as i64;
    Ok((written_at, &bytes[TIMESTAMP_LEN..]))
}

/// Persistent tier over a single LMDB environment.
pub struct LmdbTier {
    id: String,
    env: Env,
    db: Database<Bytes, Bytes>,
    index: Database<Bytes, Bytes>,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LmdbTier {
    /// Open (or create) the environment described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (including an
    /// eviction bound this tier cannot honor), if the directory cannot be
    /// created, or if the LMDB environment or databases cannot be opened.
    pub fn open(config: &LmdbConfig) -> StrataResult<Self> {
        config.validate()?;
        Self::check_policy(&config.eviction)?;
        let map_size = config.map_size_bytes().ok_or_else(|| ConfigError::InvalidValue {
            field: "lmdb.map_size_mb".to_string(),
            value: config.map_size_mb.to_string(),
            reason: "map size in bytes overflows the address space".to_string(),
        })?;
        let (env, db, index) = Self::open_env(&config.path, map_size)?;
        Ok(Self {
            id: LMDB_TIER_ID.to_string(),
            env,
            db,
            index,
            policy: config.eviction.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn check_policy(policy: &EvictionPolicy) -> StrataResult<()> {
        if let Some(max) = policy.max_size_bytes {
            return Err(ConfigError::InvalidValue {
                field: "lmdb.eviction.max_size_bytes".to_string(),
                value: max.to_string(),
                reason: "the LMDB tier is bounded by map_size_mb, not by record weight"
                    .to_string(),
            }
            .into());
        }
        if let Some(ttl) = policy.expire_after_access {
            return Err(ConfigError::InvalidValue {
                field: "lmdb.eviction.expire_after_access".to_string(),
                value: format!("{:?}", ttl),
                reason: "the LMDB tier supports expire_after_write only".to_string(),
            }
            .into());
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn open_env(
        path: &Path,
        map_size: usize,
    ) -> Result<(Env, Database<Bytes, Bytes>, Database<Bytes, Bytes>), LmdbTierError> {
        std::fs::create_dir_all(path)?;

        let env = unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(2).open(path) }
            .map_err(|e| LmdbTierError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        let index: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(INDEX_DB_NAME))
            .map_err(|e| LmdbTierError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok((env, db, index))
    }

    fn is_expired(&self, written_at: i64, now: i64) -> bool {
        match self.policy.expire_after_write {
            Some(ttl) => {
                let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
                now.saturating_sub(written_at) >= ttl_millis
            }
            None => false,
        }
    }

    fn get_stored(&self, txn: &RoTxn, key: &[u8]) -> Result<Option<Stored>, LmdbTierError> {
        match self.db.get(txn, key).map_err(txn_error)? {
            Some(bytes) => Ok(Some(decode(key, bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a record and its index entry inside the caller's transaction.
    fn delete_stored(&self, wtxn: &mut RwTxn, key: &[u8]) -> Result<Option<Stored>, LmdbTierError> {
        let Some(stored) = self.get_stored(wtxn, key)? else {
            return Ok(None);
        };
        self.db.delete(wtxn, key).map_err(txn_error)?;
        self.index
            .delete(wtxn, &index_key(stored.written_at, key))
            .map_err(txn_error)?;
        Ok(Some(stored))
    }

    fn delete_key(&self, key: &CacheKey) -> Result<Option<Record>, LmdbTierError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let removed = self.delete_stored(&mut wtxn, key.as_str().as_bytes())?;
        wtxn.commit().map_err(txn_error)?;
        Ok(removed.map(|stored| stored.record))
    }

    /// Read and delete in one write transaction. An expired record is
    /// dropped and reported as a miss.
    fn take_sync(&self, key: &CacheKey, now: i64) -> Result<Option<Record>, LmdbTierError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let taken = self.delete_stored(&mut wtxn, key.as_str().as_bytes())?;
        wtxn.commit().map_err(txn_error)?;

        match taken {
            Some(stored) if self.is_expired(stored.written_at, now) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tier = %self.id, key = %key, "expired record");
                Ok(None)
            }
            Some(stored) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(stored.record))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Delete `key` if it is still expired under a write transaction. A
    /// merge that landed after the read keeps its record.
    fn expire_sync(&self, key: &CacheKey, now: i64) -> Result<bool, LmdbTierError> {
        let key_bytes = key.as_str().as_bytes();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let still_expired = self
            .get_stored(&wtxn, key_bytes)?
            .is_some_and(|stored| self.is_expired(stored.written_at, now));
        if still_expired {
            self.delete_stored(&mut wtxn, key_bytes)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(still_expired)
    }

    fn load_sync(&self, key: &CacheKey, headers: &CacheHeaders) -> Result<Option<Record>, LmdbTierError> {
        let now = Utc::now().timestamp_millis();
        if headers.directives().contains(Directives::EVICT_AFTER_READ) {
            return self.take_sync(key, now);
        }

        let stored = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            self.get_stored(&rtxn, key.as_str().as_bytes())?
        };

        match stored {
            Some(stored) if self.is_expired(stored.written_at, now) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if self.expire_sync(key, now)? {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(tier = %self.id, key = %key, "expired record");
                }
                Ok(None)
            }
            Some(stored) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(stored.record))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn merge_sync(&self, record: &Record) -> Result<ChangeSet, LmdbTierError> {
        let now = Utc::now().timestamp_millis();
        let key_bytes = record.key().as_str().as_bytes();

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let existing = match self.get_stored(&wtxn, key_bytes)? {
            Some(stored) => {
                self.index
                    .delete(&mut wtxn, &index_key(stored.written_at, key_bytes))
                    .map_err(txn_error)?;
                (!self.is_expired(stored.written_at, now)).then_some(stored.record)
            }
            None => None,
        };

        let (merged, changed) = merge_records(existing.as_ref(), record);
        let full_bytes = encode(&merged, now)?;
        self.db
            .put(&mut wtxn, key_bytes, &full_bytes)
            .map_err(txn_error)?;
        self.index
            .put(&mut wtxn, &index_key(now, key_bytes), EMPTY)
            .map_err(txn_error)?;
        let evicted = self.enforce_bounds(&mut wtxn, now)?;
        wtxn.commit().map_err(txn_error)?;

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(changed)
    }

    /// Drop expired records, then the oldest writes until `max_entries`
    /// holds. Runs inside the caller's write transaction.
    fn enforce_bounds(&self, wtxn: &mut RwTxn, now: i64) -> Result<u64, LmdbTierError> {
        if self.policy.expire_after_write.is_none() && self.policy.max_entries.is_none() {
            return Ok(0);
        }
        let max = self
            .policy
            .max_entries
            .map(|max| usize::try_from(max).unwrap_or(usize::MAX));
        let mut remaining = usize::try_from(self.db.len(wtxn).map_err(txn_error)?).unwrap_or(usize::MAX);

        let mut victims: Vec<(Vec<u8>, Vec<u8>, bool)> = Vec::new();
        for result in self.index.iter(wtxn).map_err(txn_error)? {
            let (entry, _) = result.map_err(txn_error)?;
            let (written_at, key) = split_index_key(entry)?;
            let expired = self.is_expired(written_at, now);
            if !expired && !max.is_some_and(|max| remaining > max) {
                break;
            }
            victims.push((entry.to_vec(), key.to_vec(), expired));
            remaining = remaining.saturating_sub(1);
        }

        for (entry, key, expired) in &victims {
            self.index.delete(wtxn, entry).map_err(txn_error)?;
            self.db.delete(wtxn, key).map_err(txn_error)?;
            let reason = if *expired { "expired" } else { "oldest write" };
            tracing::debug!(
                tier = %self.id,
                key = %String::from_utf8_lossy(key),
                reason,
                "evicted record"
            );
        }
        Ok(victims.len() as u64)
    }

    fn dump_sync(&self) -> Result<BTreeMap<CacheKey, Record>, LmdbTierError> {
        let now = Utc::now().timestamp_millis();
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut records = BTreeMap::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, value) = result.map_err(txn_error)?;
            let stored = decode(key, value)?;
            if !self.is_expired(stored.written_at, now) {
                records.insert(stored.record.key().clone(), stored.record);
            }
        }
        Ok(records)
    }

    fn clear_sync(&self) -> Result<(), LmdbTierError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.clear(&mut wtxn).map_err(txn_error)?;
        self.index.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    fn len_sync(&self) -> Result<u64, LmdbTierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.db.len(&rtxn).map_err(txn_error)
    }

    fn size_sync(&self) -> Result<u64, LmdbTierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut total = 0u64;
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, value) = result.map_err(txn_error)?;
            total += (key.len() + value.len()) as u64;
        }
        Ok(total)
    }
}

#[async_trait]
impl CacheTier for LmdbTier {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load(&self, key: &CacheKey, headers: &CacheHeaders) -> StrataResult<Option<Record>> {
        Ok(self.load_sync(key, headers)?)
    }

    async fn merge(&self, record: &Record, headers: &CacheHeaders) -> StrataResult<ChangeSet> {
        if headers.directives().contains(Directives::DO_NOT_STORE) {
            return Ok(ChangeSet::new());
        }
        Ok(self.merge_sync(record)?)
    }

    async fn remove(&self, key: &CacheKey) -> StrataResult<Option<Record>> {
        Ok(self.delete_key(key)?)
    }

    async fn clear(&self) -> StrataResult<()> {
        Ok(self.clear_sync()?)
    }

    async fn dump(&self) -> StrataResult<BTreeMap<CacheKey, Record>> {
        Ok(self.dump_sync()?)
    }

    async fn len(&self) -> StrataResult<u64> {
        Ok(self.len_sync()?)
    }

    async fn stats(&self) -> StrataResult<TierStats> {
        Ok(TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len_sync()?,
            size_bytes: self.size_sync()?,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
