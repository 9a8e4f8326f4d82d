//! PAYVAULT Warmer Entry Point
//!
//! Builds the in-memory compensation stack, then keeps the critical
//! aggregates warm until interrupted. Deferred cache invalidations are
//! retried at the start of every cycle.

mod telemetry;

use std::sync::Arc;

use payvault_core::{Clock, PayvaultConfig, PayvaultError, SystemClock};
use payvault_storage::{
    warming_task, CacheStore, CompensationService, Datastore, InMemoryCacheBackend,
    InvalidationRouter, WarmingConfig, WarmingScheduler,
};
use thiserror::Error;
use tokio::sync::watch;

use telemetry::{init_tracing, TelemetryConfig};

#[derive(Debug, Error)]
pub enum WarmerError {
    #[error(transparent)]
    Payvault(#[from] PayvaultError),

    #[error("Failed to init subscriber: {0}")]
    Telemetry(String),

    #[error("Warming task failed: {0}")]
    Task(String),
}

#[tokio::main]
async fn main() -> Result<(), WarmerError> {
    init_tracing(&TelemetryConfig::default())?;

    let config = PayvaultConfig::from_env();
    config.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Datastore::new();
    let cache = Arc::new(CacheStore::from_config(
        Arc::new(InMemoryCacheBackend::new()),
        Arc::clone(&clock),
        &config,
    ));
    let router = Arc::new(InvalidationRouter::new(Arc::clone(&cache)));
    let service = CompensationService::new(store, Arc::clone(&cache), Arc::clone(&router), clock, &config);

    let scheduler = Arc::new(
        WarmingScheduler::with_defaults(Arc::clone(&cache), service.repository(), &config)
            .with_router(router),
    );

    let warming_config = WarmingConfig::from_env();
    tracing::info!(
        interval_secs = warming_config.interval.as_secs(),
        compute_timeout_ms = config.default_compute_timeout.as_millis() as u64,
        "Starting PAYVAULT warmer"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(warming_task(scheduler, warming_config, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let metrics = task.await.map_err(|e| WarmerError::Task(e.to_string()))?;
    let snapshot = metrics.snapshot();
    let stats = cache.stats();
    tracing::info!(
        cycles = snapshot.cycles,
        items_warmed = snapshot.items_warmed,
        items_failed = snapshot.items_failed,
        invalidations_retried = snapshot.invalidations_retried,
        cache_hit_rate = stats.hit_rate(),
        "PAYVAULT warmer stopped"
    );
    Ok(())
}
