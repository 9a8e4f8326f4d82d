//! PAYVAULT Test Utilities
//!
//! Shared test infrastructure for the PAYVAULT workspace:
//! - Mock collaborators (aggregate sources, failing cache backends)
//! - Proptest generators for core types
//! - Fixtures that assemble a full in-memory stack
//! - Custom assertions for PAYVAULT-specific validation

pub use payvault_core::{
    CacheError, CacheTtl, ChangeDraft, ChangeMetadata, ChangeType, Clock, CurrencyError, Decimal,
    EntityType, LedgerError, ManualClock, Money, PayvaultConfig, PayvaultError, PayvaultResult,
    StorageError, Timestamp, UserId, DEFAULT_RATES,
};
pub use payvault_storage::{
    AggregateSource, CacheBackend, CacheEntry, CacheStore, CompensationChange,
    CompensationService, Datastore, InMemoryCacheBackend, InvalidationRouter,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// Aggregate source serving canned values, with selectable failures.
///
/// Every name returns `{"name": <name>, "rows": []}` unless a value was set
/// with [`FlakyAggregateSource::with_value`]. Names marked failing return
/// `CacheError::ComputeFailed`.
#[derive(Debug, Default)]
pub struct FlakyAggregateSource {
    values: BTreeMap<String, serde_json::Value>,
    failing: Mutex<BTreeSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl FlakyAggregateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: &str, value: serde_json::Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn failing_on(self, name: &str) -> Self {
        self.set_failing(name, true);
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Number of `load_aggregate` calls for `name`.
    pub fn calls(&self, name: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.values().sum()
    }
}

#[async_trait]
impl AggregateSource for FlakyAggregateSource {
    async fn load_aggregate(&self, name: &str) -> PayvaultResult<serde_json::Value> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(name.to_string()).or_insert(0) += 1;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name);
        if failing {
            return Err(CacheError::ComputeFailed {
                key: name.to_string(),
                reason: "source offline".to_string(),
            }
            .into());
        }

        Ok(self
            .values
            .get(name)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "name": name, "rows": [] })))
    }
}

/// Cache backend that can be switched off.
///
/// While unavailable every operation fails with
/// `CacheError::StorageUnavailable`. While available it behaves like
/// [`InMemoryCacheBackend`], so entries written before an outage survive it.
#[derive(Debug)]
pub struct UnavailableBackend {
    inner: InMemoryCacheBackend,
    available: AtomicBool,
    rejected: AtomicUsize,
}

impl UnavailableBackend {
    /// A backend that is down from the start.
    pub fn down() -> Self {
        Self {
            inner: InMemoryCacheBackend::new(),
            available: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    /// A backend that starts healthy and can be taken down later.
    pub fn up() -> Self {
        let backend = Self::down();
        backend.set_available(true);
        backend
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Operations refused while down.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self) -> PayvaultResult<()> {
        if self.available.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::StorageUnavailable {
            reason: "connection refused".to_string(),
        }
        .into())
    }
}

#[async_trait]
impl CacheBackend for UnavailableBackend {
    async fn get(&self, key: &str) -> PayvaultResult<Option<CacheEntry>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: CacheEntry) -> PayvaultResult<()> {
        self.check()?;
        self.inner.put(entry).await
    }

    async fn delete(&self, key: &str) -> PayvaultResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> PayvaultResult<u64> {
        self.check()?;
        self.inner.clear().await
    }

    async fn len(&self) -> PayvaultResult<usize> {
        self.check()?;
        self.inner.len().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for PAYVAULT core types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1u64..100_000).prop_map(UserId::new)
    }

    /// A currency the default rate table supports.
    pub fn arb_currency_code() -> impl Strategy<Value = String> {
        let codes: Vec<String> = DEFAULT_RATES.codes().into_iter().map(str::to_string).collect();
        prop::sample::select(codes)
    }

    /// Non-negative amount with two decimal places, up to ten million.
    pub fn arb_amount() -> impl Strategy<Value = Decimal> {
        (0i64..1_000_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    pub fn arb_commission() -> impl Strategy<Value = Decimal> {
        (0i64..5_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    pub fn arb_money() -> impl Strategy<Value = Money> {
        (arb_amount(), arb_currency_code(), arb_commission()).prop_filter_map(
            "currency must convert",
            |(amount, code, commission)| {
                Money::from_local(amount, &code, commission, &DEFAULT_RATES).ok()
            },
        )
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-01-01 .. 2030-01-01
        (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_change_metadata() -> impl Strategy<Value = ChangeMetadata> {
        (
            arb_timestamp(),
            prop::option::of("10\\.0\\.[0-9]{1,3}\\.[0-9]{1,3}"),
            prop::option::of("[a-zA-Z]{3,12}/[0-9]\\.[0-9]"),
        )
            .prop_map(|(timestamp, ip_address, user_agent)| ChangeMetadata {
                ip_address,
                user_agent,
                timestamp,
            })
    }

    pub fn arb_change_draft() -> impl Strategy<Value = ChangeDraft> {
        (
            arb_user_id(),
            prop::option::of(arb_money()),
            prop::option::of(arb_money()),
            arb_user_id(),
            prop::option::of("[a-z ]{4,40}"),
            arb_change_metadata(),
        )
            .prop_map(
                |(subject_id, old_money, new_money, changed_by, reason, metadata)| ChangeDraft {
                    subject_id,
                    old_money,
                    new_money,
                    changed_by,
                    reason,
                    metadata,
                },
            )
    }

    pub fn arb_cache_ttl() -> impl Strategy<Value = CacheTtl> {
        prop_oneof![
            Just(CacheTtl::Short),
            Just(CacheTtl::Medium),
            Just(CacheTtl::Long),
        ]
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::Salary),
            Just(EntityType::SalaryHistory),
            Just(EntityType::User),
            Just(EntityType::Department),
            Just(EntityType::CurrencyRate),
        ]
    }

    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(:[a-z0-9]{1,8}){0,2}"
    }

    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;

    /// Whole euros with no commission.
    pub fn euros(amount: i64) -> Money {
        Money::from_euro(Decimal::from(amount), Decimal::ZERO)
    }

    pub fn metadata() -> ChangeMetadata {
        ChangeMetadata::new(chrono::Utc::now())
            .with_ip_address("10.0.0.1")
            .with_user_agent("payvault-tests/1.0")
    }

    /// A compensation change made by user 1.
    pub fn change(user: u64, amount: i64, currency: &str, commission: i64) -> CompensationChange {
        CompensationChange {
            user_id: UserId::new(user),
            local_amount: Decimal::from(amount),
            currency_code: currency.to_string(),
            commission: Decimal::from(commission),
            department: None,
            changed_by: UserId::new(1),
            reason: Some("annual review".to_string()),
            metadata: metadata(),
        }
    }

    pub fn change_in(
        user: u64,
        amount: i64,
        department: &str,
    ) -> CompensationChange {
        CompensationChange {
            department: Some(department.to_string()),
            ..change(user, amount, "EUR", 0)
        }
    }

    /// Config with a short compute timeout so timeout tests stay fast.
    pub fn test_config() -> PayvaultConfig {
        PayvaultConfig {
            default_compute_timeout: Duration::from_millis(500),
            ..PayvaultConfig::default()
        }
    }

    /// A complete in-memory stack on a manual clock.
    pub struct Harness {
        pub config: PayvaultConfig,
        pub clock: Arc<ManualClock>,
        pub store: Arc<Datastore>,
        pub cache: Arc<CacheStore>,
        pub router: Arc<InvalidationRouter>,
        pub service: Arc<CompensationService>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_backend(Arc::new(InMemoryCacheBackend::new()))
        }

        pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
            let config = test_config();
            let clock = Arc::new(ManualClock::starting_now());
            let dyn_clock: Arc<dyn Clock> = clock.clone();
            let store = Datastore::new();
            let cache = Arc::new(CacheStore::from_config(backend, Arc::clone(&dyn_clock), &config));
            let router = Arc::new(InvalidationRouter::new(Arc::clone(&cache)));
            let service = Arc::new(CompensationService::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::clone(&router),
                dyn_clock,
                &config,
            ));
            Self {
                config,
                clock,
                store,
                cache,
                router,
                service,
            }
        }
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for PAYVAULT-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &PayvaultResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &PayvaultResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert a ledger mutation was refused.
    #[track_caller]
    pub fn assert_immutable<T: std::fmt::Debug>(result: &PayvaultResult<T>, operation: &str) {
        match result {
            Err(PayvaultError::Ledger(LedgerError::ImmutableRecord { operation: op, .. })) => {
                assert_eq!(op, operation, "Wrong operation in ImmutableRecord error");
            }
            other => panic!("Expected ImmutableRecord for {}, got: {:?}", operation, other),
        }
    }

    #[track_caller]
    pub fn assert_compute_timeout<T: std::fmt::Debug>(result: &PayvaultResult<T>) {
        match result {
            Err(PayvaultError::Cache(CacheError::ComputeTimeout { .. })) => {}
            other => panic!("Expected ComputeTimeout, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_compute_failed<T: std::fmt::Debug>(result: &PayvaultResult<T>) {
        match result {
            Err(PayvaultError::Cache(CacheError::ComputeFailed { .. })) => {}
            other => panic!("Expected ComputeFailed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unsupported_currency<T: std::fmt::Debug>(result: &PayvaultResult<T>, code: &str) {
        match result {
            Err(PayvaultError::Currency(CurrencyError::UnsupportedCurrency { code: c })) => {
                assert_eq!(c, code, "Wrong currency in UnsupportedCurrency error");
            }
            other => panic!("Expected UnsupportedCurrency({}), got: {:?}", code, other),
        }
    }

    #[track_caller]
    pub fn assert_transaction_failed<T: std::fmt::Debug>(result: &PayvaultResult<T>) {
        match result {
            Err(PayvaultError::Storage(StorageError::TransactionFailed { .. })) => {}
            other => panic!("Expected TransactionFailed, got: {:?}", other),
        }
    }

    /// Assert `displayed == round(euro + commission, 2)`.
    #[track_caller]
    pub fn assert_money_consistent(money: &Money) {
        assert_eq!(
            money.displayed(),
            payvault_core::displayed(money.euro_amount(), money.commission()),
            "Displayed amount out of sync: {:?}",
            money
        );
    }

    /// Assert `records` are ordered newest first.
    #[track_caller]
    pub fn assert_newest_first(records: &[payvault_core::HistoryRecord]) {
        for pair in records.windows(2) {
            assert!(
                pair[0].created_at() >= pair[1].created_at(),
                "History out of order: {} before {}",
                pair[0].created_at(),
                pair[1].created_at()
            );
        }
    }
}
