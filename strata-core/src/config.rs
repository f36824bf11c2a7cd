//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{ConfigError, StrataError, StrataResult};

/// Bounds applied to a single tier. Any subset may be unset (no bound).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Maximum aggregate weight: key length plus estimated record size.
    pub max_size_bytes: Option<u64>,
    /// Maximum number of records.
    pub max_entries: Option<u64>,
    /// Expire records not read or written for this long.
    pub expire_after_access: Option<Duration>,
    /// Expire records this long after their last write.
    pub expire_after_write: Option<Duration>,
}

impl EvictionPolicy {
    /// A policy with no bounds at all.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_size_bytes(mut self, max: u64) -> Self {
        self.max_size_bytes = Some(max);
        self
    }

    pub fn with_max_entries(mut self, max: u64) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn with_expire_after_access(mut self, ttl: Duration) -> Self {
        self.expire_after_access = Some(ttl);
        self
    }

    pub fn with_expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_size_bytes.is_none()
            && self.max_entries.is_none()
            && self.expire_after_access.is_none()
            && self.expire_after_write.is_none()
    }

    /// Validate the policy.
    ///
    /// A zero-valued bound is rejected: it would make the tier discard every
    /// write, which is what `do-not-store` is for.
    pub fn validate(&self) -> StrataResult<()> {
        if self.max_size_bytes == Some(0) {
            return Err(invalid("max_size_bytes", "0", "max_size_bytes must be greater than 0"));
        }
        if self.max_entries == Some(0) {
            return Err(invalid("max_entries", "0", "max_entries must be greater than 0"));
        }
        if let Some(ttl) = self.expire_after_access {
            if ttl.is_zero() {
                return Err(invalid(
                    "expire_after_access",
                    &format!("{:?}", ttl),
                    "expire_after_access must be positive",
                ));
            }
        }
        if let Some(ttl) = self.expire_after_write {
            if ttl.is_zero() {
                return Err(invalid(
                    "expire_after_write",
                    &format!("{:?}", ttl),
                    "expire_after_write must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// Whether a hit in a lower tier is copied into the tiers above it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPopulation {
    /// Copy lower-tier hits into every tier above.
    #[default]
    WriteBack,
    /// Leave upper tiers untouched on reads.
    None,
}

impl ReadPopulation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "write-back" | "writeback" => Some(Self::WriteBack),
            "none" | "off" => Some(Self::None),
            _ => None,
        }
    }
}

/// Settings for the persistent LMDB tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmdbConfig {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,
    /// Maximum size of the memory map in megabytes.
    pub map_size_mb: usize,
    pub eviction: EvictionPolicy,
}

impl LmdbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map_size_mb: 256,
            eviction: EvictionPolicy::unbounded(),
        }
    }

    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    /// Map size in bytes, or `None` when it does not fit in `usize`.
    pub fn map_size_bytes(&self) -> Option<usize> {
        self.map_size_mb.checked_mul(1024 * 1024)
    }

    /// Validate the map size, path and eviction policy.
    pub fn validate(&self) -> StrataResult<()> {
        if self.map_size_mb == 0 {
            return Err(invalid("lmdb.map_size_mb", "0", "map_size_mb must be greater than 0"));
        }
        if self.map_size_bytes().is_none() {
            return Err(invalid(
                "lmdb.map_size_mb",
                &self.map_size_mb.to_string(),
                "map size in bytes overflows the address space",
            ));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "lmdb.path".to_string(),
            }
            .into());
        }
        self.eviction.validate()
    }
}

/// Top-level cache configuration: a memory tier, optionally backed by LMDB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub memory: EvictionPolicy,
    pub lmdb: Option<LmdbConfig>,
    pub read_population: ReadPopulation,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: EvictionPolicy::unbounded().with_max_size_bytes(10 * 1024 * 1024),
            lmdb: None,
            read_population: ReadPopulation::WriteBack,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_policy(mut self, policy: EvictionPolicy) -> Self {
        self.memory = policy;
        self
    }

    pub fn with_lmdb(mut self, lmdb: LmdbConfig) -> Self {
        self.lmdb = Some(lmdb);
        self
    }

    pub fn with_read_population(mut self, population: ReadPopulation) -> Self {
        self.read_population = population;
        self
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_MEMORY_MAX_BYTES`: memory tier size bound (default: 10 MiB)
    /// - `STRATA_MEMORY_MAX_ENTRIES`: memory tier entry bound (default: unset)
    /// - `STRATA_MEMORY_EXPIRE_AFTER_ACCESS_SECS`: idle expiry (default: unset)
    /// - `STRATA_MEMORY_EXPIRE_AFTER_WRITE_SECS`: write expiry (default: unset)
    /// - `STRATA_LMDB_PATH`: enables the LMDB tier at this directory
    /// - `STRATA_LMDB_MAP_SIZE_MB`: LMDB map size (default: 256)
    /// - `STRATA_READ_POPULATION`: `write-back` or `none` (default: write-back)
    pub fn from_env() -> StrataResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`], reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> StrataResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(max) = parse_var::<u64, _>(&lookup, "STRATA_MEMORY_MAX_BYTES")? {
            config.memory.max_size_bytes = Some(max);
        }
        config.memory.max_entries = parse_var(&lookup, "STRATA_MEMORY_MAX_ENTRIES")?;
        config.memory.expire_after_access =
            parse_var::<u64, _>(&lookup, "STRATA_MEMORY_EXPIRE_AFTER_ACCESS_SECS")?
                .map(Duration::from_secs);
        config.memory.expire_after_write =
            parse_var::<u64, _>(&lookup, "STRATA_MEMORY_EXPIRE_AFTER_WRITE_SECS")?
                .map(Duration::from_secs);

        if let Some(path) = lookup("STRATA_LMDB_PATH").filter(|p| !p.trim().is_empty()) {
            let mut lmdb = LmdbConfig::new(path.trim());
            if let Some(size) = parse_var(&lookup, "STRATA_LMDB_MAP_SIZE_MB")? {
                lmdb.map_size_mb = size;
            }
            config.lmdb = Some(lmdb);
        }

        if let Some(raw) = lookup("STRATA_READ_POPULATION") {
            config.read_population = ReadPopulation::parse(raw.trim()).ok_or_else(|| {
                invalid(
                    "STRATA_READ_POPULATION",
                    &raw,
                    "expected one of: write-back, none",
                )
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> StrataResult<()> {
        self.memory.validate()?;
        if let Some(lmdb) = &self.lmdb {
            lmdb.validate()?;
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> StrataError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_var<T, F>(lookup: &F, name: &str) -> StrataResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "expected a non-negative integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::default().lmdb.is_none());
    }

    #[test]
    fn test_zero_bounds_are_rejected() {
        let policy = EvictionPolicy::unbounded().with_max_entries(0);
        assert!(matches!(policy.validate(), Err(StrataError::Config(_))));

        let policy = EvictionPolicy::unbounded().with_expire_after_write(Duration::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("STRATA_MEMORY_MAX_BYTES", "2048"),
            ("STRATA_MEMORY_MAX_ENTRIES", "50"),
            ("STRATA_MEMORY_EXPIRE_AFTER_ACCESS_SECS", "30"),
            ("STRATA_MEMORY_EXPIRE_AFTER_WRITE_SECS", "60"),
            ("STRATA_LMDB_PATH", "/tmp/strata"),
            ("STRATA_LMDB_MAP_SIZE_MB", "64"),
            ("STRATA_READ_POPULATION", "none"),
        ]))
        .unwrap();

        assert_eq!(config.memory.max_size_bytes, Some(2048));
        assert_eq!(config.memory.max_entries, Some(50));
        assert_eq!(config.memory.expire_after_access, Some(Duration::from_secs(30)));
        assert_eq!(config.memory.expire_after_write, Some(Duration::from_secs(60)));
        let lmdb = config.lmdb.expect("lmdb should be configured");
        assert_eq!(lmdb.path, PathBuf::from("/tmp/strata"));
        assert_eq!(lmdb.map_size_mb, 64);
        assert_eq!(config.read_population, ReadPopulation::None);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = CacheConfig::from_lookup(lookup_from(&[("STRATA_MEMORY_MAX_ENTRIES", "many")]));
        assert!(matches!(
            result,
            Err(StrataError::Config(ConfigError::InvalidValue { .. }))
        ));

        let result = CacheConfig::from_lookup(lookup_from(&[("STRATA_READ_POPULATION", "sometimes")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let huge = (usize::MAX / 4).to_string();
        let result = CacheConfig::from_lookup(lookup_from(&[
            ("STRATA_LMDB_PATH", "/tmp/strata"),
            ("STRATA_LMDB_MAP_SIZE_MB", huge.as_str()),
        ]));
        assert!(matches!(
            result,
            Err(StrataError::Config(ConfigError::InvalidValue { ref field, .. })) if field == "lmdb.map_size_mb"
        ));

        let lmdb = LmdbConfig::new("/tmp/strata").with_map_size_mb(usize::MAX);
        assert_eq!(lmdb.map_size_bytes(), None);
        assert!(lmdb.validate().is_err());
        assert_eq!(LmdbConfig::new("/tmp/strata").with_map_size_mb(2).map_size_bytes(), Some(2 << 20));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_memory_policy(EvictionPolicy::unbounded().with_max_entries(10))
            .with_lmdb(LmdbConfig::new("/var/cache/strata").with_map_size_mb(32))
            .with_read_population(ReadPopulation::None);
        assert_eq!(config.memory.max_entries, Some(10));
        assert_eq!(config.lmdb.as_ref().map(|l| l.map_size_mb), Some(32));
        assert!(config.validate().is_ok());
    }
}
