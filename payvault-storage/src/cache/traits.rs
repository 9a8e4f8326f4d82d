//! Cache backend trait and entry type.
//!
//! A backend only stores opaque payloads by key. Tagging, expiry policy,
//! compression and single-flight all live in [`super::CacheStore`], so a
//! backend can be swapped (in-memory for tests, a shared server in
//! production) without touching invalidation logic.

use async_trait::async_trait;
use payvault_core::{PayvaultResult, Timestamp};
use std::collections::BTreeSet;

/// One stored cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized value, gzip-compressed when `compressed` is set.
    pub payload: Vec<u8>,
    pub compressed: bool,
    pub tags: BTreeSet<String>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Pluggable key/value storage for cache entries.
///
/// Implementations must be safe for concurrent use. A backend that cannot
/// reach its storage reports `CacheError::StorageUnavailable`; the store
/// then bypasses the cache instead of failing the read.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch an entry, expired or not.
    async fn get(&self, key: &str) -> PayvaultResult<Option<CacheEntry>>;

    /// Insert or replace an entry.
    async fn put(&self, entry: CacheEntry) -> PayvaultResult<()>;

    /// Remove an entry. Returns whether one existed.
    async fn delete(&self, key: &str) -> PayvaultResult<bool>;

    /// Remove several entries. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> PayvaultResult<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop everything.
    async fn clear(&self) -> PayvaultResult<u64>;

    /// Number of stored entries, including expired ones not yet reaped.
    async fn len(&self) -> PayvaultResult<usize>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (absent or expired).
    pub misses: u64,
    /// Number of compute function invocations.
    pub computes: u64,
    /// Reads served by computing directly because the backend was down.
    pub bypasses: u64,
    /// Keys removed by `forget` / `forget_by_tags`.
    pub evictions: u64,
    /// Writes stored in compressed form.
    pub compressed_writes: u64,
    /// Computed values discarded because an invalidation raced them.
    pub discarded_writes: u64,
}

impl CacheStats {
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
