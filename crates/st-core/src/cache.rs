//! Small in-memory TTL cache with prefix invalidation.
//!
//! Meant for memoizing statistics reads. Eviction at capacity is FIFO by
//! insertion order, not LRU: the oldest inserted key goes first, however hot.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

/// Source of the current time, injectable for tests.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc>,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    /// Insertion sequence, the eviction order.
    seq: u64,
}

/// Keyed cache whose entries expire after a time-to-live.
#[derive(Debug)]
pub struct TtlCache<V, C = SystemClock> {
    entries: HashMap<String, CacheEntry<V>>,
    insertion_order: BTreeMap<u64, String>,
    next_seq: u64,
    ttl: Duration,
    max_entries: Option<usize>,
    clock: C,
}

impl<V> TtlCache<V, SystemClock> {
    /// Creates a cache on the wall clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }
}

impl<V, C: Clock> TtlCache<V, C> {
    /// Creates a cache reading time from `clock`. Negative TTLs count as zero.
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: BTreeMap::new(),
            next_seq: 0,
            ttl: ttl.max(Duration::zero()),
            max_entries: None,
            clock,
        }
    }

    /// Caps the number of entries; inserting a new key at the cap evicts the
    /// oldest inserted one. A cap of 0 means unbounded.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Returns the value for `key` unless it is missing or expired.
    ///
    /// Expired entries are dropped on read.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let now = self.clock.now();
        let expired = self.entries.get(key).map(|entry| now > entry.expires_at)?;
        if expired {
            self.invalidate(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn has(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Stores `value` under the default TTL.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    /// Stores `value` with its own TTL.
    ///
    /// A TTL past the end of representable time never expires.
    /// Overwriting an existing key keeps its place in the eviction order.
    pub fn set_with_ttl(&mut self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl.max(Duration::zero()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }

        if let Some(max) = self.max_entries.filter(|&max| max > 0) {
            while self.entries.len() >= max {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.insertion_order.insert(seq, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                seq,
            },
        );
    }

    /// Removes `key`. Returns whether it was present.
    pub fn invalidate(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.insertion_order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    /// Removes every key starting with `prefix`. Returns how many were removed.
    pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            self.invalidate(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.insertion_order.pop_first() else {
            return false;
        };
        tracing::trace!(%key, "evicting oldest cache entry");
        self.entries.remove(&key);
        true
    }
}
