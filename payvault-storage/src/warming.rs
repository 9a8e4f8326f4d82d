//! Cache warming.
//!
//! A fixed list of aggregates is recomputed and written into the cache
//! ahead of reader demand, either on request ([`WarmingScheduler::warm_all`])
//! or periodically from [`warming_task`]. One failing aggregate never stops
//! the others from being warmed.
//!
//! # Configuration
//!
//! ```rust,ignore
//! let config = WarmingConfig {
//!     interval: Duration::from_secs(900), // every 15 minutes
//!     log_failures: true,
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use payvault_core::{CacheTtl, PayvaultConfig, PayvaultResult, StorageError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::aggregates::{self, AggregateSource};
use crate::cache::CacheStore;
use crate::invalidation::{tags, InvalidationRouter};

// ============================================================================
// TARGETS
// ============================================================================

/// One aggregate kept warm: where it is cached, for how long, under which
/// tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmTarget {
    pub name: String,
    pub key: String,
    pub tier: CacheTtl,
    pub tags: Vec<String>,
}

impl WarmTarget {
    pub fn new(name: &str, tier: CacheTtl, tags: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key: name.to_string(),
            tier,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// The critical aggregates warmed by default.
pub fn default_targets() -> Vec<WarmTarget> {
    vec![
        WarmTarget::new(
            aggregates::USER_OVERVIEW,
            CacheTtl::Medium,
            &[tags::USERS, tags::STATISTICS],
        ),
        WarmTarget::new(
            aggregates::SALARY_OVERVIEW,
            CacheTtl::Medium,
            &[tags::SALARIES, tags::STATISTICS],
        ),
        WarmTarget::new(
            aggregates::TOP_EARNERS,
            CacheTtl::Medium,
            &[tags::SALARIES, tags::STATISTICS],
        ),
        WarmTarget::new(
            aggregates::CURRENCY_BREAKDOWN,
            CacheTtl::Long,
            &[tags::SALARIES, tags::STATISTICS],
        ),
        WarmTarget::new(aggregates::RECENT_CHANGES, CacheTtl::Short, &[tags::STATISTICS]),
    ]
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WarmStatus {
    Warmed,
    /// Computed, but an invalidation landed first so nothing was cached.
    /// The next cycle warms it again.
    Discarded,
    Failed { reason: String },
}

/// Outcome for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmItem {
    pub name: String,
    pub status: WarmStatus,
    /// Rows or fields in the cached value; zero when nothing was cached.
    pub count: u64,
}

/// Outcome of warming every target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub items: Vec<WarmItem>,
}

impl WarmReport {
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == WarmStatus::Warmed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    /// Names of the targets that were not warmed.
    pub fn failures(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| item.status != WarmStatus::Warmed)
            .map(|item| item.name.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct WarmingScheduler {
    cache: Arc<CacheStore>,
    source: Arc<dyn AggregateSource>,
    targets: Vec<WarmTarget>,
    compute_timeout: Duration,
    router: Option<Arc<InvalidationRouter>>,
}

impl WarmingScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        source: Arc<dyn AggregateSource>,
        targets: Vec<WarmTarget>,
        compute_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            targets,
            compute_timeout,
            router: None,
        }
    }

    /// Scheduler over [`default_targets`].
    pub fn with_defaults(
        cache: Arc<CacheStore>,
        source: Arc<dyn AggregateSource>,
        config: &PayvaultConfig,
    ) -> Self {
        Self::new(cache, source, default_targets(), config.default_compute_timeout)
    }

    /// Retry the router's deferred invalidations at the start of every
    /// periodic cycle.
    pub fn with_router(mut self, router: Arc<InvalidationRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn targets(&self) -> &[WarmTarget] {
        &self.targets
    }

    /// Recompute and store every target, continuing past failures.
    pub async fn warm_all(&self) -> WarmReport {
        let mut report = WarmReport::default();
        for target in &self.targets {
            report.items.push(self.warm_target(target).await);
        }

        if report.is_complete() {
            tracing::info!(warmed = report.succeeded(), "Cache warming completed");
        } else {
            tracing::warn!(
                warmed = report.succeeded(),
                failed = report.failed(),
                failures = ?report.failures(),
                "Cache warming completed with failures"
            );
        }
        report
    }

    /// Warm a single target by name.
    pub async fn warm_one(&self, name: &str) -> PayvaultResult<WarmItem> {
        let target = self
            .targets
            .iter()
            .find(|target| target.name == name)
            .ok_or_else(|| StorageError::UnknownAggregate {
                name: name.to_string(),
            })?;
        Ok(self.warm_target(target).await)
    }

    async fn warm_target(&self, target: &WarmTarget) -> WarmItem {
        let source = Arc::clone(&self.source);
        let name = target.name.clone();
        let result = self
            .cache
            .refresh(
                &target.key,
                target.tier,
                &target.tags,
                self.compute_timeout,
                move || async move { source.load_aggregate(&name).await },
            )
            .await;

        match result {
            Ok(refreshed) if !refreshed.stored => {
                tracing::warn!(
                    name = %target.name,
                    key = %target.key,
                    "Aggregate invalidated while warming, not cached"
                );
                WarmItem {
                    name: target.name.clone(),
                    status: WarmStatus::Discarded,
                    count: 0,
                }
            }
            Ok(refreshed) => {
                let count = value_count(&refreshed.value);
                tracing::debug!(name = %target.name, key = %target.key, count, "Warmed aggregate");
                WarmItem {
                    name: target.name.clone(),
                    status: WarmStatus::Warmed,
                    count,
                }
            }
            Err(e) => {
                tracing::error!(name = %target.name, error = %e, "Failed to warm aggregate");
                WarmItem {
                    name: target.name.clone(),
                    status: WarmStatus::Failed {
                        reason: e.to_string(),
                    },
                    count: 0,
                }
            }
        }
    }
}

fn value_count(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Array(items) => items.len() as u64,
        serde_json::Value::Object(fields) => fields.len() as u64,
        serde_json::Value::Null => 0,
        _ => 1,
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Configuration for the periodic warming task.
#[derive(Debug, Clone)]
pub struct WarmingConfig {
    /// Time between warming cycles. The first cycle runs immediately.
    pub interval: Duration,
    /// Log each failed target at error level (default: true).
    pub log_failures: bool,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self::from_config(&PayvaultConfig::default())
    }
}

impl WarmingConfig {
    pub fn from_config(config: &PayvaultConfig) -> Self {
        Self {
            interval: config.warm_interval,
            log_failures: true,
        }
    }

    /// Create WarmingConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `PAYVAULT_WARM_INTERVAL_SECS`: seconds between cycles (default: 900)
    /// - `PAYVAULT_WARM_LOG_FAILURES`: log failed targets (default: true)
    pub fn from_env() -> Self {
        let log_failures = std::env::var("PAYVAULT_WARM_LOG_FAILURES")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            log_failures,
            ..Self::from_config(&PayvaultConfig::from_env())
        }
    }

    /// Short interval for development.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(30),
            log_failures: true,
        }
    }
}

/// Counters for the warming task.
#[derive(Debug, Default)]
pub struct WarmingMetrics {
    pub cycles: AtomicU64,
    pub items_warmed: AtomicU64,
    pub items_failed: AtomicU64,
    pub invalidations_retried: AtomicU64,
}

impl WarmingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> WarmingSnapshot {
        WarmingSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            items_warmed: self.items_warmed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            invalidations_retried: self.invalidations_retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmingSnapshot {
    pub cycles: u64,
    pub items_warmed: u64,
    pub items_failed: u64,
    pub invalidations_retried: u64,
}

/// Warm every target on `config.interval` until `shutdown_rx` flips to
/// `true`.
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(warming_task(scheduler, WarmingConfig::from_env(), shutdown_rx));
/// // ...
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn warming_task(
    scheduler: Arc<WarmingScheduler>,
    config: WarmingConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<WarmingMetrics> {
    let metrics = Arc::new(WarmingMetrics::new());

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        targets = scheduler.targets().len(),
        "Cache warming task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache warming task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                run_cycle(&scheduler, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        items_warmed = snapshot.items_warmed,
        items_failed = snapshot.items_failed,
        "Cache warming task completed"
    );

    metrics
}

async fn run_cycle(scheduler: &WarmingScheduler, config: &WarmingConfig, metrics: &WarmingMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    if let Some(router) = &scheduler.router {
        let before = router.pending_count();
        if before > 0 {
            let still_pending = router.retry_pending().await;
            metrics
                .invalidations_retried
                .fetch_add(before.saturating_sub(still_pending) as u64, Ordering::Relaxed);
        }
    }

    let report = scheduler.warm_all().await;
    metrics
        .items_warmed
        .fetch_add(report.succeeded() as u64, Ordering::Relaxed);
    metrics
        .items_failed
        .fetch_add(report.failed() as u64, Ordering::Relaxed);

    if config.log_failures {
        for item in &report.items {
            if let WarmStatus::Failed { reason } = &item.status {
                tracing::error!(name = %item.name, reason = %reason, "Warm target failed this cycle");
            }
        }
    }
}
