//! PAYVAULT Core - Compensation Types
//!
//! Pure data structures shared by every other crate: identities, money and
//! the fixed currency converter, history records with their change
//! classification, cache tiers, configuration, clocks and the error
//! taxonomy. No I/O happens here.

pub mod clock;
pub mod config;
pub mod enums;
pub mod error;
pub mod history;
pub mod identity;
pub mod money;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PayvaultConfig;
pub use enums::{CacheTtl, ChangeType, EntityType};
pub use error::{
    CacheError, ConfigError, CurrencyError, LedgerError, PayvaultError, PayvaultResult,
    StorageError,
};
pub use history::{classify_change, ChangeDraft, ChangeMetadata, HistoryRecord, TimeRange};
pub use identity::{
    compute_content_hash, new_record_id, ContentHash, RecordId, Timestamp, UserId, GENESIS_HASH,
};
pub use money::{displayed, round_money, Money, RateTable, BASE_CURRENCY, DEFAULT_RATES};

// Re-exported so downstream crates agree on the decimal type.
pub use rust_decimal::Decimal;
