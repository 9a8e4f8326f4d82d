//! PAYVAULT Storage - Cache, Invalidation and History Ledger
//!
//! Everything with state lives here:
//!
//! - [`cache`]: the tag-indexed [`CacheStore`] with single-flight
//!   `remember`, tiered expiry and transparent compression.
//! - [`invalidation`]: maps entity writes to the keys and tags they affect.
//! - [`warming`]: recomputes critical aggregates ahead of demand.
//! - [`history`]: the append-only, hash-chained compensation ledger.
//! - [`unit_of_work`]: the in-memory datastore and its transactions.
//! - [`compensation`]: the write path tying the pieces together.
//!
//! Write flow: `CompensationService::set_compensation` stages the record and
//! its ledger entry in one [`Transaction`], commits, then asks the
//! [`InvalidationRouter`] to evict dependent cache entries.

pub mod aggregates;
pub mod cache;
pub mod compensation;
pub mod history;
pub mod invalidation;
pub mod unit_of_work;
pub mod warming;

pub use aggregates::{
    AggregateSource, CurrencyTotals, RecentChange, SalaryOverview, TopEarner, UserOverview,
};
pub use cache::{
    CacheBackend, CacheEntry, CacheStats, CacheStore, InMemoryCacheBackend, PayloadCodec,
    Refreshed, TagIndex,
};
pub use compensation::{CompensationChange, CompensationRepository, CompensationService};
pub use history::HistoryLedger;
pub use invalidation::{
    InvalidationContext, InvalidationPlan, InvalidationReport, InvalidationRouter,
};
pub use unit_of_work::{CommitReceipt, CompensationRecord, Datastore, Transaction};
pub use warming::{
    default_targets, warming_task, WarmItem, WarmReport, WarmStatus, WarmTarget, WarmingConfig,
    WarmingMetrics, WarmingScheduler, WarmingSnapshot,
};
