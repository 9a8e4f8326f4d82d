//! Cache store behaviour through the public API: single-flight, deadlines,
//! backend outages, tag eviction and large payloads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use payvault_core::{CacheTtl, Clock, ManualClock, PayvaultResult, SystemClock};
use payvault_storage::{CacheBackend, CacheStore, InMemoryCacheBackend, PayloadCodec};
use payvault_test_utils::assertions::{assert_compute_failed, assert_compute_timeout};
use payvault_test_utils::generators::{arb_cache_key, arb_cache_ttl, arb_tag};
use payvault_test_utils::{CacheError, UnavailableBackend};
use proptest::prelude::*;

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

// ============================================================================
// SINGLE-FLIGHT
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_compute_once() {
    let cache = Arc::new(CacheStore::in_memory());
    let computes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let computes = Arc::clone(&computes);
        handles.push(tokio::spawn(async move {
            cache
                .remember(
                    "salary_overview",
                    CacheTtl::Medium,
                    &["salaries"],
                    Duration::from_secs(5),
                    move || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, payvault_core::PayvaultError>(vec![42u64, 7, 19])
                    },
                )
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("task panicked").expect("remember"));
    }

    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == &vec![42u64, 7, 19]));
    assert_eq!(
        cache.get::<Vec<u64>>("salary_overview").await.expect("get"),
        Some(vec![42, 7, 19])
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reaches_every_waiter_and_stores_nothing() {
    let cache = Arc::new(CacheStore::in_memory());
    let computes = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let computes = Arc::clone(&computes);
        handles.push(tokio::spawn(async move {
            cache
                .remember(
                    "top_earners",
                    CacheTtl::Medium,
                    &["salaries"],
                    Duration::from_millis(100),
                    move || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, payvault_core::PayvaultError>(1u32)
                    },
                )
                .await
        }));
    }

    for handle in handles {
        let result = handle.await.expect("task panicked");
        assert_compute_timeout(&result);
    }
    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get::<u32>("top_earners").await.expect("get"), None);
    assert!(cache.tagged_keys("salaries").await.expect("tagged").is_empty());
}

#[tokio::test]
async fn test_failed_compute_is_not_cached() {
    let cache = CacheStore::in_memory();

    let failed: PayvaultResult<u32> = cache
        .remember("k", CacheTtl::Short, &["t"], Duration::from_secs(1), || async {
            Err(CacheError::ComputeFailed {
                key: "k".to_string(),
                reason: "database down".to_string(),
            }
            .into())
        })
        .await;
    assert_compute_failed(&failed);

    let value: u32 = cache
        .remember("k", CacheTtl::Short, &["t"], Duration::from_secs(1), || async { Ok(3) })
        .await
        .expect("second attempt");
    assert_eq!(value, 3);
}

// ============================================================================
// BACKEND OUTAGES
// ============================================================================

#[tokio::test]
async fn test_unavailable_backend_is_bypassed() {
    let backend = Arc::new(UnavailableBackend::down());
    let cache = CacheStore::new(backend.clone(), system_clock(), PayloadCodec::default());
    let computes = AtomicUsize::new(0);

    for _ in 0..2 {
        let computes = &computes;
        let value: String = cache
            .remember(
                "user_overview",
                CacheTtl::Medium,
                &["users"],
                Duration::from_secs(1),
                move || async move {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                },
            )
            .await
            .expect("bypass computes directly");
        assert_eq!(value, "fresh");
    }

    // Nothing can be cached, so each read computes.
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().bypasses, 2);
    assert!(backend.rejected() >= 2);
}

#[tokio::test]
async fn test_entries_survive_a_backend_outage() {
    let backend = Arc::new(UnavailableBackend::up());
    let cache = CacheStore::new(backend.clone(), system_clock(), PayloadCodec::default());
    cache
        .put("currency_breakdown", &vec!["EUR", "USD"], CacheTtl::Long, &["salaries"])
        .await
        .expect("put");

    backend.set_available(false);
    assert!(cache.get::<Vec<String>>("currency_breakdown").await.is_err());

    backend.set_available(true);
    assert_eq!(
        cache
            .get::<Vec<String>>("currency_breakdown")
            .await
            .expect("get"),
        Some(vec!["EUR".to_string(), "USD".to_string()])
    );
}

// ============================================================================
// TAGS AND EXPIRY
// ============================================================================

#[tokio::test]
async fn test_forget_by_tags_leaves_other_tags_alone() {
    let cache = CacheStore::in_memory();
    cache.put("a", &1, CacheTtl::Medium, &["salaries"]).await.expect("put");
    cache
        .put("b", &2, CacheTtl::Medium, &["salaries", "statistics"])
        .await
        .expect("put");
    cache.put("c", &3, CacheTtl::Medium, &["users"]).await.expect("put");

    let evicted = cache.forget_by_tags(&["statistics"]).await.expect("evict");
    assert_eq!(evicted, 1);
    assert_eq!(cache.get::<i32>("a").await.expect("get"), Some(1));
    assert_eq!(cache.get::<i32>("b").await.expect("get"), None);
    assert_eq!(cache.get::<i32>("c").await.expect("get"), Some(3));

    // "b" no longer appears under its other tag either.
    assert_eq!(
        cache.tagged_keys("salaries").await.expect("tagged"),
        vec!["a".to_string()]
    );
}

#[tokio::test]
async fn test_tiers_expire_on_the_store_clock() {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = CacheStore::new(
        Arc::new(InMemoryCacheBackend::new()),
        clock.clone(),
        PayloadCodec::default(),
    );
    cache.put("short", &1, CacheTtl::Short, &["t"]).await.expect("put");
    cache.put("long", &2, CacheTtl::Long, &["t"]).await.expect("put");

    clock.advance(CacheTtl::Short.duration() + Duration::from_secs(1));
    assert_eq!(cache.get::<i32>("short").await.expect("get"), None);
    assert_eq!(cache.get::<i32>("long").await.expect("get"), Some(2));

    clock.advance(CacheTtl::Long.duration());
    assert_eq!(cache.get::<i32>("long").await.expect("get"), None);
}

#[tokio::test]
async fn test_large_value_is_compressed_and_round_trips() {
    let backend = Arc::new(InMemoryCacheBackend::new());
    let cache = CacheStore::new(backend.clone(), system_clock(), PayloadCodec::default());
    let rows: Vec<String> = (0..2_000)
        .map(|i| format!("user-{i}:engineering:EUR"))
        .collect();

    cache
        .put("recent_changes", &rows, CacheTtl::Short, &["statistics"])
        .await
        .expect("put");

    let stored = backend
        .get("recent_changes")
        .await
        .expect("backend get")
        .expect("entry present");
    assert!(stored.compressed);
    assert_eq!(cache.stats().compressed_writes, 1);
    assert_eq!(
        cache.get::<Vec<String>>("recent_changes").await.expect("get"),
        Some(rows)
    );
}

#[tokio::test]
async fn test_small_value_is_stored_plain() {
    let backend = Arc::new(InMemoryCacheBackend::new());
    let cache = CacheStore::new(backend.clone(), system_clock(), PayloadCodec::default());
    cache.put("tiny", &"x", CacheTtl::Short, &["t"]).await.expect("put");

    let stored = backend.get("tiny").await.expect("get").expect("present");
    assert!(!stored.compressed);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After evicting a tag, exactly the keys that carried it are gone.
    #[test]
    fn prop_tag_eviction_is_exact(
        entries in prop::collection::btree_map(arb_cache_key(), prop::collection::btree_set(arb_tag(), 1..3), 1..12),
        victim in arb_tag(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let cache = CacheStore::in_memory();
            for (key, tags) in &entries {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                cache.put(key, &1u8, CacheTtl::Medium, &tags).await.expect("put");
            }

            let expected = entries.values().filter(|tags| tags.contains(&victim)).count() as u64;
            let evicted = cache.forget_by_tags(&[victim.as_str()]).await.expect("evict");
            prop_assert_eq!(evicted, expected);

            for (key, tags) in &entries {
                let present = cache.get::<u8>(key).await.expect("get").is_some();
                prop_assert_eq!(present, !tags.contains(&victim));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// An entry is readable until its tier's duration has elapsed on the
    /// store clock, and not after.
    #[test]
    fn prop_entries_live_exactly_their_tier(
        key in arb_cache_key(),
        ttl in arb_cache_ttl(),
        tag in arb_tag(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let clock = Arc::new(ManualClock::starting_now());
            let cache = CacheStore::new(
                Arc::new(InMemoryCacheBackend::new()),
                clock.clone(),
                PayloadCodec::default(),
            );
            cache.put(&key, &42u32, ttl, &[tag.as_str()]).await.expect("put");

            clock.advance(ttl.duration() - Duration::from_secs(1));
            prop_assert_eq!(cache.get::<u32>(&key).await.expect("get"), Some(42));

            clock.advance(Duration::from_secs(1));
            prop_assert_eq!(cache.get::<u32>(&key).await.expect("get"), None);
            prop_assert!(cache.tag_index().keys_for(&tag).is_empty());
            Ok::<(), TestCaseError>(())
        })?;
    }
}
