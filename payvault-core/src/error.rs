//! Error types for PAYVAULT operations

use crate::RecordId;
use std::time::Duration;
use thiserror::Error;

/// Currency conversion errors.
///
/// These are caller errors: surfaced immediately and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("Unsupported currency: {code}")]
    UnsupportedCurrency { code: String },

    #[error("Inconsistent money value: displayed {displayed} != euro {euro} + commission {commission}")]
    InconsistentAmount {
        euro: String,
        commission: String,
        displayed: String,
    },
}

/// History ledger errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// A caller attempted to modify or remove a history record.
    #[error("History record {record_id} is immutable: {operation} is not permitted")]
    ImmutableRecord {
        record_id: RecordId,
        operation: String,
    },

    #[error("History chain broken at sequence {sequence}")]
    ChainBroken { sequence: u64 },

    #[error("Unit of work already closed")]
    TransactionClosed,

    #[error("History record could not be encoded for hashing: {reason}")]
    Encoding { reason: String },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Compute for key '{key}' exceeded its deadline of {timeout:?}")]
    ComputeTimeout { key: String, timeout: Duration },

    #[error("Compute for key '{key}' failed: {reason}")]
    ComputeFailed { key: String, reason: String },

    #[error("Single-flight leader for key '{key}' went away before publishing a result")]
    LeaderAborted { key: String },

    #[error("Cache storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Compression error: {reason}")]
    Compression { reason: String },
}

/// Persistence errors for compensation records and the ledger store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Aggregate not available: {name}")]
    UnknownAggregate { name: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all PAYVAULT errors.
///
/// `Clone` so a single failed computation can be handed to every
/// single-flight waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayvaultError {
    #[error("Currency error: {0}")]
    Currency(#[from] CurrencyError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl PayvaultError {
    /// True when the cache backend itself is down and the caller should
    /// fall back to computing the value directly.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            PayvaultError::Cache(CacheError::StorageUnavailable { .. })
        )
    }
}

/// Result type alias for PAYVAULT operations.
pub type PayvaultResult<T> = Result<T, PayvaultError>;

// =============================================================================
// TESTS
// =============================================================================
