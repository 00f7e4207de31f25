//! In-process secondary stores backed by `DashMap`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{Counter, SecondaryStore, StorageError};

/// Writes between sweeps of stale counters and expired entries
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct Window {
    closes_at: Instant,
    count: u64,
}

/// Windows too long for the clock are capped at roughly a century
fn window_end(now: Instant, window: Duration) -> Instant {
    now.checked_add(window)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

/// Fixed-window counters shared by both in-process stores
#[derive(Debug, Default)]
struct CounterTable {
    windows: DashMap<String, Window>,
    hits: AtomicU64,
}

impl CounterTable {
    fn increment(&self, key: &str, window: Duration) -> Counter {
        let now = Instant::now();
        let counter = {
            // The entry guard holds the shard lock for the whole update
            let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
                closes_at: window_end(now, window),
                count: 0,
            });
            if entry.closes_at <= now {
                *entry = Window {
                    closes_at: window_end(now, window),
                    count: 0,
                };
            }
            entry.count += 1;
            Counter {
                count: entry.count,
                resets_in: entry.closes_at.saturating_duration_since(now),
            }
        };

        if self.hits.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }
        counter
    }

    fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.closes_at > now);
        before.saturating_sub(self.windows.len())
    }

    fn len(&self) -> usize {
        self.windows.len()
    }
}

/// In-process store for plain values. Does not expire entries:
/// `set_with_ttl` fails with [`StorageError::TtlUnsupported`]. Counters
/// still expire.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: DashMap<String, String>,
    counters: CounterTable,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Live and not yet swept counter windows
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl SecondaryStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<String, StorageError> {
        self.data
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
    ) -> Result<(), StorageError> {
        Err(StorageError::TtlUnsupported)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<Counter, StorageError> {
        Ok(self.counters.increment(key, window))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Default in-process store, with TTL support. Expiry is checked lazily on
/// read and expired entries are swept every few hundred writes;
/// [`purge_expired`](Self::purge_expired) reclaims memory on demand.
#[derive(Debug, Default)]
pub struct TtlMemoryStorage {
    data: DashMap<String, Entry>,
    counters: CounterTable,
    writes: AtomicU64,
}

impl TtlMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.data.len()) + self.counters.sweep(now);
        if removed > 0 {
            tracing::debug!("Purged {} expired storage entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    fn insert(&self, key: &str, entry: Entry) {
        self.data.insert(key.to_string(), entry);
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_expired();
        }
    }
}

#[async_trait]
impl SecondaryStore for TtlMemoryStorage {
    async fn get(&self, key: &str) -> Result<String, StorageError> {
        let now = Instant::now();
        let value = match self.data.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(entry.value.clone()),
            Some(_) => None,
            None => return Err(StorageError::NotFound),
        };

        // Expired: drop it, unless a concurrent writer refreshed it
        self.data.remove_if(key, |_, entry| !entry.is_live(now));
        value.ok_or(StorageError::NotFound)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.insert(
            key,
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let expires_at = Instant::now().checked_add(ttl);
        if expires_at.is_none() {
            tracing::debug!("TTL for '{}' overflows the clock, storing without expiry", key);
        }
        self.insert(key, Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<Counter, StorageError> {
        Ok(self.counters.increment(key, window))
    }
}
