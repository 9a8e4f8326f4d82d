//! Compensation records: repository, aggregate source and write service.
//!
//! [`CompensationService::set_compensation`] is the one write path. It
//! converts the amount, stages the record and its ledger entry in one
//! transaction, commits, and only then invalidates the affected caches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payvault_core::{
    CacheError, CacheTtl, ChangeMetadata, Clock, Decimal, HistoryRecord, Money, PayvaultConfig,
    PayvaultError, PayvaultResult, RateTable, StorageError, TimeRange, UserId, DEFAULT_RATES,
};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::aggregates::{self, AggregateSource, SalaryOverview};
use crate::cache::CacheStore;
use crate::history::HistoryLedger;
use crate::invalidation::{
    tags, user_history_key, user_salary_key, InvalidationContext, InvalidationRouter,
};
use crate::unit_of_work::{CompensationRecord, Datastore, Transaction};

/// Read access to committed compensation records.
pub struct CompensationRepository {
    store: Arc<Datastore>,
    top_earners_limit: usize,
    recent_changes_limit: usize,
}

impl CompensationRepository {
    pub fn new(store: Arc<Datastore>, config: &PayvaultConfig) -> Self {
        Self {
            store,
            top_earners_limit: config.top_earners_limit,
            recent_changes_limit: config.recent_changes_limit,
        }
    }

    pub fn get(&self, user_id: UserId) -> PayvaultResult<Option<CompensationRecord>> {
        Ok(self.store.read()?.records.get(&user_id).cloned())
    }

    /// All records ordered by user id.
    pub fn all(&self) -> PayvaultResult<Vec<CompensationRecord>> {
        let mut records: Vec<CompensationRecord> =
            self.store.read()?.records.values().cloned().collect();
        records.sort_by_key(|record| record.user_id);
        Ok(records)
    }

    pub fn count(&self) -> PayvaultResult<usize> {
        Ok(self.store.read()?.records.len())
    }

    /// Stage a write of `record` on `tx`.
    pub fn stage(&self, tx: &mut Transaction, record: CompensationRecord) -> PayvaultResult<()> {
        tx.upsert_record(record)
    }

    fn recent_history(&self, limit: usize) -> PayvaultResult<Vec<HistoryRecord>> {
        let state = self.store.read()?;
        let mut history: Vec<HistoryRecord> = state.history.iter().rev().take(limit).cloned().collect();
        history.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.sequence().cmp(&a.sequence()))
        });
        Ok(history)
    }
}

#[async_trait]
impl AggregateSource for CompensationRepository {
    async fn load_aggregate(&self, name: &str) -> PayvaultResult<serde_json::Value> {
        match name {
            aggregates::USER_OVERVIEW => to_value(&aggregates::user_overview(&self.all()?)),
            aggregates::SALARY_OVERVIEW => to_value(&aggregates::salary_overview(&self.all()?)),
            aggregates::TOP_EARNERS => to_value(&aggregates::top_earners(
                &self.all()?,
                self.top_earners_limit,
            )),
            aggregates::CURRENCY_BREAKDOWN => {
                to_value(&aggregates::currency_breakdown(&self.all()?))
            }
            aggregates::RECENT_CHANGES => to_value(&aggregates::recent_changes(
                &self.recent_history(self.recent_changes_limit)?,
                self.recent_changes_limit,
            )),
            other => Err(StorageError::UnknownAggregate {
                name: other.to_string(),
            }
            .into()),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> PayvaultResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| {
        PayvaultError::from(CacheError::Serialization {
            reason: e.to_string(),
        })
    })
}

/// A requested change to one user's compensation.
#[derive(Debug, Clone)]
pub struct CompensationChange {
    pub user_id: UserId,
    pub local_amount: Decimal,
    pub currency_code: String,
    pub commission: Decimal,
    /// `None` keeps the current department.
    pub department: Option<String>,
    pub changed_by: UserId,
    pub reason: Option<String>,
    pub metadata: ChangeMetadata,
}

/// Write path and cached reads for compensation.
pub struct CompensationService {
    store: Arc<Datastore>,
    repository: Arc<CompensationRepository>,
    ledger: Arc<HistoryLedger>,
    cache: Arc<CacheStore>,
    router: Arc<InvalidationRouter>,
    clock: Arc<dyn Clock>,
    rates: &'static RateTable,
    compute_timeout: Duration,
    // Serializes writers so concurrent transactions never race for the
    // ledger tail.
    write_lane: Mutex<()>,
}

impl CompensationService {
    pub fn new(
        store: Arc<Datastore>,
        cache: Arc<CacheStore>,
        router: Arc<InvalidationRouter>,
        clock: Arc<dyn Clock>,
        config: &PayvaultConfig,
    ) -> Self {
        Self {
            repository: Arc::new(CompensationRepository::new(Arc::clone(&store), config)),
            ledger: Arc::new(HistoryLedger::new(Arc::clone(&store), Arc::clone(&clock))),
            store,
            cache,
            router,
            clock,
            rates: &DEFAULT_RATES,
            compute_timeout: config.default_compute_timeout,
            write_lane: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> Arc<CompensationRepository> {
        Arc::clone(&self.repository)
    }

    pub fn ledger(&self) -> Arc<HistoryLedger> {
        Arc::clone(&self.ledger)
    }

    /// Apply `change`, record it in the ledger and invalidate dependent
    /// caches.
    ///
    /// The record write and the ledger entry commit together. Invalidation
    /// runs strictly after the commit and cannot fail the call.
    pub async fn set_compensation(&self, change: CompensationChange) -> PayvaultResult<HistoryRecord> {
        let money = Money::from_local(
            change.local_amount,
            &change.currency_code,
            change.commission,
            self.rates,
        )?;

        let (history, department_changed) = {
            let _lane = self.write_lane.lock().await;
            let previous = self.repository.get(change.user_id)?;
            let department = change
                .department
                .clone()
                .or_else(|| previous.as_ref().and_then(|p| p.department.clone()));
            let department_changed = previous
                .as_ref()
                .is_some_and(|p| p.department != department);

            let mut tx = self.store.begin();
            self.repository.stage(
                &mut tx,
                CompensationRecord {
                    user_id: change.user_id,
                    money: money.clone(),
                    department,
                    updated_at: self.clock.now(),
                },
            )?;
            let history = self.ledger.append(
                &mut tx,
                change.user_id,
                previous.map(|p| p.money),
                Some(money),
                change.changed_by,
                change.reason,
                change.metadata,
            )?;
            tx.commit()?;
            (history, department_changed)
        };

        tracing::info!(
            user_id = %change.user_id,
            changed_by = %change.changed_by,
            change_type = %history.change_type(),
            record_id = %history.id(),
            "Compensation updated"
        );

        let entity_id = change.user_id.to_string();
        let context = InvalidationContext::for_user(change.user_id);
        self.router.invalidate("salary", &entity_id, &context).await;
        self.router
            .invalidate("salary_history", &entity_id, &context)
            .await;
        if department_changed {
            self.router
                .invalidate("user", &entity_id, &context.with_salary_affected())
                .await;
        }

        Ok(history)
    }

    /// Current compensation of `user_id`, cached per user.
    pub async fn user_salary(&self, user_id: UserId) -> PayvaultResult<Option<CompensationRecord>> {
        let repository = Arc::clone(&self.repository);
        self.cache
            .remember(
                &user_salary_key(user_id),
                CacheTtl::Short,
                &[tags::SALARIES],
                self.compute_timeout,
                move || async move { repository.get(user_id) },
            )
            .await
    }

    /// Ledger entries about `user_id`, newest first, cached per user.
    pub async fn user_history(&self, user_id: UserId) -> PayvaultResult<Vec<HistoryRecord>> {
        let ledger = Arc::clone(&self.ledger);
        self.cache
            .remember(
                &user_history_key(user_id),
                CacheTtl::Short,
                &[tags::STATISTICS],
                self.compute_timeout,
                move || async move { ledger.query_by_subject(user_id, TimeRange::all()) },
            )
            .await
    }

    pub async fn salary_overview(&self) -> PayvaultResult<SalaryOverview> {
        let repository = Arc::clone(&self.repository);
        self.cache
            .remember(
                aggregates::SALARY_OVERVIEW,
                CacheTtl::Medium,
                &[tags::SALARIES, tags::STATISTICS],
                self.compute_timeout,
                move || async move {
                    let value = repository.load_aggregate(aggregates::SALARY_OVERVIEW).await?;
                    serde_json::from_value(value).map_err(|e| {
                        PayvaultError::from(CacheError::Serialization {
                            reason: e.to_string(),
                        })
                    })
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payvault_core::{ChangeType, CurrencyError, ManualClock};

    fn service() -> CompensationService {
        let config = PayvaultConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let cache = Arc::new(CacheStore::in_memory());
        let router = Arc::new(InvalidationRouter::new(Arc::clone(&cache)));
        CompensationService::new(Datastore::new(), cache, router, clock, &config)
    }

    fn change(user: u64, amount: i64, currency: &str, commission: i64) -> CompensationChange {
        CompensationChange {
            user_id: UserId::new(user),
            local_amount: Decimal::from(amount),
            currency_code: currency.to_string(),
            commission: Decimal::from(commission),
            department: Some("engineering".to_string()),
            changed_by: UserId::new(1),
            reason: Some("annual review".to_string()),
            metadata: ChangeMetadata::new(chrono::Utc::now()).with_ip_address("10.0.0.1"),
        }
    }

    #[tokio::test]
    async fn test_first_assignment_has_no_old_value() {
        let service = service();
        let record = service
            .set_compensation(change(7, 40_000, "EUR", 500))
            .await
            .expect("set");

        assert!(record.old_money().is_none());
        assert_eq!(record.change_type(), ChangeType::SalaryChange);
        assert!(record.delta_euro().is_none());
        assert_eq!(service.ledger().len().expect("len"), 1);
    }

    #[tokio::test]
    async fn test_raise_is_recorded_with_delta() {
        let service = service();
        service
            .set_compensation(change(7, 40_000, "EUR", 500))
            .await
            .expect("set");
        let raise = service
            .set_compensation(change(7, 45_000, "EUR", 500))
            .await
            .expect("raise");

        assert_eq!(raise.change_type(), ChangeType::SalaryChange);
        assert_eq!(raise.delta_euro(), Some(Decimal::new(500_000, 2)));
        assert!(raise.is_increase());
        service.ledger().verify_chain().expect("chain");
    }

    #[tokio::test]
    async fn test_unsupported_currency_writes_nothing() {
        let service = service();
        let err = service
            .set_compensation(change(7, 40_000, "XYZ", 0))
            .await
            .expect_err("unsupported");

        assert!(matches!(
            err,
            PayvaultError::Currency(CurrencyError::UnsupportedCurrency { .. })
        ));
        assert_eq!(service.ledger().len().expect("len"), 0);
        assert!(service.repository().get(UserId::new(7)).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_cached_salary_is_invalidated_by_write() {
        let service = service();
        service
            .set_compensation(change(7, 40_000, "EUR", 0))
            .await
            .expect("set");

        let before = service
            .user_salary(UserId::new(7))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(before.money.euro_amount(), Decimal::from(40_000));

        service
            .set_compensation(change(7, 42_000, "EUR", 0))
            .await
            .expect("set");
        let after = service
            .user_salary(UserId::new(7))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(after.money.euro_amount(), Decimal::from(42_000));
    }

    #[tokio::test]
    async fn test_salary_overview_refreshes_after_write() {
        let service = service();
        service
            .set_compensation(change(1, 40_000, "EUR", 0))
            .await
            .expect("set");
        assert_eq!(service.salary_overview().await.expect("overview").count, 1);

        service
            .set_compensation(change(2, 50_000, "EUR", 0))
            .await
            .expect("set");
        let overview = service.salary_overview().await.expect("overview");
        assert_eq!(overview.count, 2);
        assert_eq!(overview.total_displayed, Decimal::from(90_000));
    }

    #[tokio::test]
    async fn test_department_is_kept_when_not_given() {
        let service = service();
        service
            .set_compensation(change(7, 40_000, "EUR", 0))
            .await
            .expect("set");
        let mut keep = change(7, 41_000, "EUR", 0);
        keep.department = None;
        service.set_compensation(keep).await.expect("set");

        let record = service
            .repository()
            .get(UserId::new(7))
            .expect("get")
            .expect("present");
        assert_eq!(record.department.as_deref(), Some("engineering"));
    }

    #[tokio::test]
    async fn test_unknown_aggregate_is_an_error() {
        let service = service();
        let err = service
            .repository()
            .load_aggregate("payroll_forecast")
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            PayvaultError::Storage(StorageError::UnknownAggregate { .. })
        ));
    }
}
