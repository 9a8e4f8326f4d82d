//! Tiered, tag-indexed cache store.
//!
//! `CacheStore` is the only entry point compute code uses for caching. It
//! owns the tag index, payload compression and single-flight coordination;
//! the backend underneath only stores bytes.
//!
//! # Key lifecycle
//!
//! absent -> pending (single-flight in progress) -> present -> expired -> evicted
//!
//! Expired entries are treated as absent on read and removed lazily.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use payvault_core::{
    CacheError, CacheTtl, Clock, PayvaultConfig, PayvaultError, PayvaultResult, SystemClock,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::PayloadCodec;
use super::memory_backend::InMemoryCacheBackend;
use super::single_flight::SingleFlight;
use super::tag_index::{GenerationSnapshot, TagIndex};
use super::traits::{CacheBackend, CacheEntry, CacheStats};

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
    bypasses: AtomicU64,
    evictions: AtomicU64,
    compressed_writes: AtomicU64,
    discarded_writes: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            discarded_writes: self.discarded_writes.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`CacheStore::refresh`].
#[derive(Debug, Clone, PartialEq)]
pub struct Refreshed<T> {
    pub value: T,
    /// False when an invalidation landed during the compute and the value
    /// was not cached.
    pub stored: bool,
}

/// Cache of serialized aggregates with tag-based invalidation.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    tags: TagIndex,
    flights: SingleFlight,
    codec: PayloadCodec,
    clock: Arc<dyn Clock>,
    stats: StatsCounters,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>, codec: PayloadCodec) -> Self {
        Self {
            backend,
            tags: TagIndex::new(),
            flights: SingleFlight::new(),
            codec,
            clock,
            stats: StatsCounters::default(),
        }
    }

    pub fn from_config(
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        config: &PayvaultConfig,
    ) -> Self {
        Self::new(backend, clock, PayloadCodec::from_config(config))
    }

    /// In-memory store on the system clock with default compression.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCacheBackend::new()),
            Arc::new(SystemClock),
            PayloadCodec::default(),
        )
    }

    /// Read a cached value. Absent and expired entries both yield `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> PayvaultResult<Option<T>> {
        match self.fetch(key).await? {
            Some(raw) => deserialize(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key` for the tier's duration and register it
    /// under every tag.
    ///
    /// Computations for `key` already in flight are superseded: their
    /// results are no longer cached over this value.
    pub async fn put<T, S>(&self, key: &str, value: &T, ttl: CacheTtl, tags: &[S]) -> PayvaultResult<()>
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let tags = owned_tags(tags);
        self.tags.bump_key(key);
        let snapshot = self.tags.snapshot(key, &tags);
        let raw = serialize(value)?;
        self.store(key, raw, ttl, &tags, &snapshot).await?;
        Ok(())
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// Concurrent misses for the same key run `compute` once; the other
    /// callers wait for and share its result, including its error. `compute`
    /// is bounded by `timeout`; on expiry every waiter gets
    /// `CacheError::ComputeTimeout` and nothing is stored. When the backend is
    /// unreachable the value is computed directly and not cached.
    pub async fn remember<T, S, F, Fut>(
        &self,
        key: &str,
        ttl: CacheTtl,
        tags: &[S],
        timeout: Duration,
        compute: F,
    ) -> PayvaultResult<T>
    where
        T: Serialize + DeserializeOwned,
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PayvaultResult<T>>,
    {
        match self.fetch(key).await {
            Ok(Some(raw)) => match deserialize(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                    if let Err(e) = self.forget(key).await {
                        tracing::warn!(key, error = %e, "Failed to drop undecodable cache entry");
                    }
                }
            },
            Ok(None) => {}
            Err(e) if e.is_storage_unavailable() => {
                tracing::warn!(key, error = %e, "Cache backend unavailable, computing directly");
                self.stats.bypasses.fetch_add(1, Ordering::Relaxed);
                self.stats.computes.fetch_add(1, Ordering::Relaxed);
                return bounded(key, timeout, compute()).await;
            }
            Err(e) => return Err(e),
        }

        let tags = owned_tags(tags);
        let snapshot = self.tags.snapshot(key, &tags);
        let raw = self
            .flights
            .run(key, snapshot.clone(), || {
                self.lead(key, ttl, &tags, timeout, snapshot, compute)
            })
            .await?;
        deserialize(&raw)
    }

    /// Recompute `key` unconditionally and store the result.
    ///
    /// Used by warming, where the point is to replace whatever is cached.
    /// If the key or one of its tags is invalidated while computing, the
    /// value is returned but not cached and `stored` is false.
    pub async fn refresh<T, S, F, Fut>(
        &self,
        key: &str,
        ttl: CacheTtl,
        tags: &[S],
        timeout: Duration,
        compute: F,
    ) -> PayvaultResult<Refreshed<T>>
    where
        T: Serialize + DeserializeOwned,
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PayvaultResult<T>>,
    {
        let tags = owned_tags(tags);
        let snapshot = self.tags.snapshot(key, &tags);
        self.stats.computes.fetch_add(1, Ordering::Relaxed);
        let value = bounded(key, timeout, compute()).await?;
        let stored = self
            .store(key, serialize(&value)?, ttl, &tags, &snapshot)
            .await?;
        Ok(Refreshed { value, stored })
    }

    /// Remove `key` and its tag back-references. Returns whether an entry
    /// existed.
    pub async fn forget(&self, key: &str) -> PayvaultResult<bool> {
        self.tags.bump_key(key);
        let removed = self.backend.delete(key).await?;
        self.tags.unregister_key(key);
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(key, removed, "Forgot cache key");
        Ok(removed)
    }

    /// Evict every key registered under any of `tags`.
    ///
    /// Returns the number of distinct keys evicted. Keys registered only
    /// under other tags are untouched. If the backend delete fails, the tag
    /// references are kept so a retry still finds the keys.
    pub async fn forget_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> PayvaultResult<u64> {
        self.tags.bump_tags(tags);
        let keys: Vec<String> = self.tags.keys_for_any(tags).into_iter().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        self.backend.delete_many(&keys).await?;
        for key in &keys {
            self.tags.unregister_key(key);
        }

        let count = keys.len() as u64;
        self.stats.evictions.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(
            tags = ?owned_tags(tags),
            evicted = count,
            "Evicted cache keys by tag"
        );
        Ok(count)
    }

    /// Live keys registered under `tag`. Stale references are pruned.
    pub async fn tagged_keys(&self, tag: &str) -> PayvaultResult<Vec<String>> {
        let now = self.clock.now();
        let mut live = Vec::new();
        for key in self.tags.keys_for(tag) {
            match self.backend.get(&key).await? {
                Some(entry) if !entry.is_expired(now) => live.push(key),
                _ => {}
            }
        }
        let keep: std::collections::HashSet<&str> = live.iter().map(String::as_str).collect();
        self.tags.keys_for_live(tag, |key| keep.contains(key));
        Ok(live)
    }

    /// Drop every entry and tag reference.
    pub async fn flush(&self) -> PayvaultResult<u64> {
        self.tags.clear();
        let removed = self.backend.clear().await?;
        tracing::info!(removed, "Flushed cache");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// Leader side of a `remember` miss.
    async fn lead<T, F, Fut>(
        &self,
        key: &str,
        ttl: CacheTtl,
        tags: &[String],
        timeout: Duration,
        snapshot: GenerationSnapshot,
        compute: F,
    ) -> PayvaultResult<Arc<[u8]>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PayvaultResult<T>>,
    {
        // A previous flight may have stored the value after our miss.
        match self.peek(key).await {
            Ok(Some(raw)) => return Ok(Arc::from(raw)),
            Ok(None) => {}
            Err(e) => tracing::debug!(key, error = %e, "Re-check before compute failed"),
        }

        self.stats.computes.fetch_add(1, Ordering::Relaxed);
        let value = bounded(key, timeout, compute()).await?;
        let raw = serialize(&value)?;
        let shared: Arc<[u8]> = Arc::from(raw.as_slice());

        if let Err(e) = self.store(key, raw, ttl, tags, &snapshot).await {
            if e.is_storage_unavailable() {
                self.stats.bypasses.fetch_add(1, Ordering::Relaxed);
            }
            tracing::warn!(key, error = %e, "Computed value could not be cached");
        }
        Ok(shared)
    }

    /// Read and decode `key`, counting a hit or miss.
    async fn fetch(&self, key: &str) -> PayvaultResult<Option<Vec<u8>>> {
        let found = self.read_live(key).await?;
        let counter = if found.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    /// Like `fetch` but without touching the statistics.
    async fn peek(&self, key: &str) -> PayvaultResult<Option<Vec<u8>>> {
        self.read_live(key).await
    }

    async fn read_live(&self, key: &str) -> PayvaultResult<Option<Vec<u8>>> {
        let Some(entry) = self.backend.get(key).await? else {
            return Ok(None);
        };

        if entry.is_expired(self.clock.now()) {
            tracing::trace!(key, "Cache entry expired");
            self.backend.delete(key).await?;
            self.tags.unregister_key(key);
            return Ok(None);
        }

        match self.codec.decode(&entry.payload, entry.compressed) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Dropping corrupt cache entry");
                self.backend.delete(key).await?;
                self.tags.unregister_key(key);
                Ok(None)
            }
        }
    }

    /// Encode and write `raw`, then register its tags. Returns false without
    /// writing if an invalidation touched the key or its tags since
    /// `snapshot`; a write that raced one is undone.
    async fn store(
        &self,
        key: &str,
        raw: Vec<u8>,
        ttl: CacheTtl,
        tags: &[String],
        snapshot: &GenerationSnapshot,
    ) -> PayvaultResult<bool> {
        if !self.tags.is_current(key, snapshot) {
            tracing::debug!(key, "Invalidated while computing, skipping write");
            self.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let encoded = self.codec.encode(raw)?;
        let compressed = encoded.compressed;
        let now = self.clock.now();
        let entry = CacheEntry {
            key: key.to_string(),
            payload: encoded.bytes,
            compressed,
            tags: tags.iter().cloned().collect(),
            created_at: now,
            expires_at: now + ttl_span(ttl),
        };

        self.backend.put(entry).await?;
        self.tags.unregister_key(key);
        for tag in tags {
            self.tags.register(tag, key);
        }

        if !self.tags.is_current(key, snapshot) {
            tracing::debug!(key, "Invalidated while computing, discarding write");
            self.stats.discarded_writes.fetch_add(1, Ordering::Relaxed);
            self.tags.unregister_key(key);
            self.backend.delete(key).await?;
            return Ok(false);
        }

        if compressed {
            self.stats.compressed_writes.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(key, ttl = %ttl, compressed, "Stored cache entry");
        Ok(true)
    }
}

async fn bounded<T, Fut>(key: &str, timeout: Duration, compute: Fut) -> PayvaultResult<T>
where
    Fut: Future<Output = PayvaultResult<T>>,
{
    match tokio::time::timeout(timeout, compute).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(key, timeout_ms = timeout.as_millis() as u64, "Cache compute timed out");
            Err(CacheError::ComputeTimeout {
                key: key.to_string(),
                timeout,
            }
            .into())
        }
    }
}

fn ttl_span(ttl: CacheTtl) -> chrono::Duration {
    chrono::Duration::seconds(ttl.duration().as_secs() as i64)
}

fn owned_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    tags.iter().map(|tag| tag.as_ref().to_string()).collect()
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> PayvaultResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(serialization_error)
}

fn deserialize<T: DeserializeOwned>(raw: &[u8]) -> PayvaultResult<T> {
    serde_json::from_slice(raw).map_err(serialization_error)
}

fn serialization_error(e: serde_json::Error) -> PayvaultError {
    CacheError::Serialization {
        reason: e.to_string(),
    }
    .into()
}
