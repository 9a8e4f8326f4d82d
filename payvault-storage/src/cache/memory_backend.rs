//! In-process cache backend.

use async_trait::async_trait;
use dashmap::DashMap;
use payvault_core::PayvaultResult;

use super::traits::{CacheBackend, CacheEntry};

/// Sharded in-memory backend. Used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes held.
    pub fn memory_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.value().size_bytes() as u64)
            .sum()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> PayvaultResult<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> PayvaultResult<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PayvaultResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self) -> PayvaultResult<u64> {
        let count = self.entries.len() as u64;
        self.entries.clear();
        Ok(count)
    }

    async fn len(&self) -> PayvaultResult<usize> {
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn entry(key: &str, payload: &[u8]) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            payload: payload.to_vec(),
            compressed: false,
            tags: BTreeSet::new(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = InMemoryCacheBackend::new();
        backend.put(entry("a", b"one")).await.expect("put");
        backend.put(entry("b", b"two")).await.expect("put");

        let found = backend.get("a").await.expect("get").expect("present");
        assert_eq!(found.payload, b"one");
        assert_eq!(backend.len().await.expect("len"), 2);
        assert_eq!(backend.memory_bytes(), 6);

        assert!(backend.delete("a").await.expect("delete"));
        assert!(!backend.delete("a").await.expect("delete"));
        assert!(backend.get("a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_delete_many_counts_existing() {
        let backend = InMemoryCacheBackend::new();
        backend.put(entry("a", b"1")).await.expect("put");
        backend.put(entry("b", b"2")).await.expect("put");

        let removed = backend
            .delete_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .expect("delete_many");
        assert_eq!(removed, 2);
        assert_eq!(backend.clear().await.expect("clear"), 0);
    }
}
