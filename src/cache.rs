//! Last-known-good flight category cache with oldest-first eviction.

use rustc_hash::FxHashMap;

use crate::category::{Category, Icao};

/// Default number of airports the cache holds.
pub const DEFAULT_CAPACITY: usize = 256;

/// A cached category and the wall-clock second it was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRecord {
    pub category: Category,
    pub updated_at: u64,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheRecord),
    /// Missing, stale under the age policy, or stored as `Unknown`.
    Unknown,
}

impl Lookup {
    pub fn category(self) -> Category {
        match self {
            Lookup::Hit(record) => record.category,
            Lookup::Unknown => Category::Unknown,
        }
    }
}

/// Fixed-capacity category cache.
///
/// Upserting a new key at capacity evicts the record with the oldest
/// `updated_at` (ties broken by identifier so eviction is deterministic).
pub struct CategoryCache {
    entries: FxHashMap<Icao, CacheRecord>,
    capacity: usize,
    max_age_secs: Option<u64>,
}

impl CategoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            capacity,
            max_age_secs: None,
        }
    }

    /// Treat records older than `max_age_secs` as absent on lookup.
    pub fn with_max_age(mut self, max_age_secs: Option<u64>) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    /// Insert or overwrite a record. Returns the evicted key, if any.
    pub fn upsert(&mut self, key: Icao, category: Category, updated_at: u64) -> Option<Icao> {
        let record = CacheRecord {
            category,
            updated_at,
        };

        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = record;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(k, r)| (r.updated_at, **k))
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
            oldest
        } else {
            None
        };

        self.entries.insert(key, record);
        evicted
    }

    /// Look up a key as of wall-clock second `now`.
    pub fn get(&self, key: &Icao, now: u64) -> Lookup {
        match self.entries.get(key) {
            Some(record) if record.category.is_known() && self.is_fresh(record, now) => {
                Lookup::Hit(*record)
            }
            _ => Lookup::Unknown,
        }
    }

    /// Number of live records holding a flight category.
    pub fn known_count(&self, now: u64) -> usize {
        self.entries
            .values()
            .filter(|record| record.category.is_known() && self.is_fresh(record, now))
            .count()
    }

    fn is_fresh(&self, record: &CacheRecord, now: u64) -> bool {
        match self.max_age_secs {
            Some(max_age) => now.saturating_sub(record.updated_at) <= max_age,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CategoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
