//! STRATA Storage - Cache Tiers
//!
//! The [`CacheTier`] contract, the bounded [`MemoryTier`], the persistent
//! [`LmdbTier`] and the [`TierChain`] that layers them.

pub mod chain;
pub mod lmdb;
pub mod memory;
pub mod tier;

pub use chain::{FailureMode, TierChain, TierOptions};
pub use lmdb::{LmdbTier, LmdbTierError, LMDB_TIER_ID};
pub use memory::{MemoryTier, MEMORY_TIER_ID};
pub use tier::{CacheTier, TierStats};
