//! End-to-end write path: record + ledger commit, then cache invalidation.

use std::sync::Arc;

use payvault_core::{ChangeType, Decimal, TimeRange, UserId};
use payvault_storage::aggregates;
use payvault_test_utils::assertions::{assert_money_consistent, assert_unsupported_currency};
use payvault_test_utils::fixtures::{change, change_in, Harness};
use payvault_test_utils::UnavailableBackend;

#[tokio::test]
async fn test_reads_after_a_write_see_the_committed_value() {
    let harness = Harness::new();
    let service = &harness.service;
    service.set_compensation(change(7, 40_000, "EUR", 0)).await.expect("set");

    // Prime every cached read for user 7.
    service.user_salary(UserId::new(7)).await.expect("salary");
    assert_eq!(service.user_history(UserId::new(7)).await.expect("history").len(), 1);
    assert_eq!(service.salary_overview().await.expect("overview").count, 1);

    service.set_compensation(change(7, 48_000, "EUR", 0)).await.expect("raise");

    let salary = service
        .user_salary(UserId::new(7))
        .await
        .expect("salary")
        .expect("present");
    assert_eq!(salary.money.euro_amount(), Decimal::from(48_000));
    assert_eq!(service.user_history(UserId::new(7)).await.expect("history").len(), 2);
    assert_eq!(
        service.salary_overview().await.expect("overview").total_displayed,
        Decimal::from(48_000)
    );
}

#[tokio::test]
async fn test_write_evicts_statistics_but_not_user_directory() {
    let harness = Harness::new();
    harness
        .cache
        .put(aggregates::USER_OVERVIEW, &"cached", payvault_core::CacheTtl::Medium, &["users"])
        .await
        .expect("put");
    harness
        .cache
        .put(aggregates::RECENT_CHANGES, &"cached", payvault_core::CacheTtl::Short, &["statistics"])
        .await
        .expect("put");

    harness.service.set_compensation(change(4, 30_000, "EUR", 0)).await.expect("set");

    assert!(harness
        .cache
        .get::<String>(aggregates::USER_OVERVIEW)
        .await
        .expect("get")
        .is_some());
    assert!(harness
        .cache
        .get::<String>(aggregates::RECENT_CHANGES)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn test_department_move_also_invalidates_user_caches() {
    let harness = Harness::new();
    harness.service.set_compensation(change_in(4, 30_000, "sales")).await.expect("set");
    harness
        .cache
        .put("directory", &"cached", payvault_core::CacheTtl::Long, &["users"])
        .await
        .expect("put");

    harness.service.set_compensation(change_in(4, 30_000, "engineering")).await.expect("move");

    assert!(harness.cache.get::<String>("directory").await.expect("get").is_none());
    let moved = harness
        .service
        .repository()
        .get(UserId::new(4))
        .expect("get")
        .expect("present");
    assert_eq!(moved.department.as_deref(), Some("engineering"));
}

#[tokio::test]
async fn test_foreign_currency_is_converted_and_consistent() {
    let harness = Harness::new();
    let record = harness
        .service
        .set_compensation(change(5, 10_000, "usd", 120))
        .await
        .expect("set");

    let money = record.new_money().expect("new money");
    assert_eq!(money.currency_code(), "USD");
    assert_eq!(money.euro_amount(), Decimal::from(9_200));
    assert_eq!(money.displayed(), Decimal::from(9_320));
    assert_money_consistent(money);
}

#[tokio::test]
async fn test_unsupported_currency_leaves_no_trace() {
    let harness = Harness::new();
    let result = harness.service.set_compensation(change(5, 10_000, "ABC", 0)).await;

    assert_unsupported_currency(&result, "ABC");
    assert!(harness.service.ledger().is_empty().expect("is_empty"));
}

#[tokio::test]
async fn test_write_succeeds_while_cache_is_down() {
    let backend = Arc::new(UnavailableBackend::down());
    let harness = Harness::with_backend(backend.clone());

    let record = harness
        .service
        .set_compensation(change(6, 20_000, "EUR", 0))
        .await
        .expect("write is not failed by invalidation");
    assert_eq!(record.change_type(), ChangeType::SalaryChange);
    assert!(harness.router.pending_count() > 0);

    // Reads bypass the dead backend.
    let salary = harness
        .service
        .user_salary(UserId::new(6))
        .await
        .expect("bypass")
        .expect("present");
    assert_eq!(salary.money.euro_amount(), Decimal::from(20_000));

    backend.set_available(true);
    assert_eq!(harness.router.retry_pending().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_the_chain_intact() {
    let harness = Harness::new();
    let mut handles = Vec::new();
    for user in 1..=20u64 {
        let service = Arc::clone(&harness.service);
        handles.push(tokio::spawn(async move {
            service
                .set_compensation(change(user % 5 + 1, 30_000 + user as i64 * 100, "EUR", 0))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked").expect("set");
    }

    let ledger = harness.service.ledger();
    assert_eq!(ledger.len().expect("len"), 20);
    ledger.verify_chain().expect("chain intact");
    assert_eq!(harness.service.repository().count().expect("count"), 5);

    let per_user = ledger
        .query_by_subject(UserId::new(1), TimeRange::all())
        .expect("query");
    assert_eq!(per_user.len(), 4);
}
