//! Secondary storage
//!
//! A key/value layer that sits beside the primary store for hot paths
//! (session lookups, rate-limit counters). It is only ever used cache-aside:
//! callers fall back to the primary store on a miss and never treat an
//! entry here as proof that a user or session exists.

mod memory;

pub use memory::{MemoryStorage, TtlMemoryStorage};

use std::time::Duration;

use async_trait::async_trait;

/// Secondary storage error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found")]
    NotFound,

    /// The implementation cannot expire entries
    #[error("TTL is not supported by this storage")]
    TtlUnsupported,

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// State of a fixed-window counter after one increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Increments seen in the current window, this one included
    pub count: u64,
    /// Time until the window closes and the count restarts at zero
    pub resets_in: Duration,
}

/// Pluggable key/value cache
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Fails with [`StorageError::NotFound`] if the key is absent or expired
    async fn get(&self, key: &str) -> Result<String, StorageError>;

    /// Overwrite `key` with no expiry
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Overwrite `key`; it reads as absent once `ttl` has elapsed
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
    -> Result<(), StorageError>;

    /// Idempotent
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Atomically count one hit on `key`. The first hit opens a window of
    /// length `window`; hits after it closes start a new one. Counters are
    /// a separate namespace from `get`/`set` values and always expire,
    /// even on stores without TTL for plain values.
    async fn increment(&self, key: &str, window: Duration) -> Result<Counter, StorageError>;
}
