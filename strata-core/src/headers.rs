//! Per-operation cache headers.
//!
//! Headers are an open map of names to values passed alongside every read and
//! write. Only the names in [`Directives`] change behavior; anything else is
//! carried through untouched and ignored.

use bitflags::bitflags;
use std::collections::BTreeMap;

/// Merge is a no-op: nothing is written to any tier.
pub const DO_NOT_STORE: &str = "do-not-store";
/// A successful load removes the record from the tier it was found in.
pub const EVICT_AFTER_READ: &str = "evict-after-read";
/// The operation is confined to the first tier of the chain.
pub const MEMORY_CACHE_ONLY: &str = "memory-cache-only";

bitflags! {
    /// Recognized directives, parsed from [`CacheHeaders`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Directives: u8 {
        const DO_NOT_STORE = 0b0000_0001;
        const EVICT_AFTER_READ = 0b0000_0010;
        const MEMORY_CACHE_ONLY = 0b0000_0100;
    }
}

impl Default for Directives {
    fn default() -> Self {
        Self::empty()
    }
}

/// Open set of named headers for one cache operation. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHeaders {
    headers: BTreeMap<String, String>,
}

impl CacheHeaders {
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a header, replacing any previous value under the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a valueless flag header.
    pub fn with_flag(self, name: impl Into<String>) -> Self {
        self.with_header(name, "true")
    }

    pub fn do_not_store() -> Self {
        Self::default().with_flag(DO_NOT_STORE)
    }

    pub fn evict_after_read() -> Self {
        Self::default().with_flag(EVICT_AFTER_READ)
    }

    pub fn memory_cache_only() -> Self {
        Self::default().with_flag(MEMORY_CACHE_ONLY)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The recognized directives present in these headers.
    ///
    /// A flag whose value is `"false"` counts as absent.
    pub fn directives(&self) -> Directives {
        let mut directives = Directives::empty();
        for (name, flag) in [
            (DO_NOT_STORE, Directives::DO_NOT_STORE),
            (EVICT_AFTER_READ, Directives::EVICT_AFTER_READ),
            (MEMORY_CACHE_ONLY, Directives::MEMORY_CACHE_ONLY),
        ] {
            if let Some(value) = self.headers.get(name) {
                if !value.eq_ignore_ascii_case("false") {
                    directives |= flag;
                }
            }
        }
        directives
    }
}
