//! Cache layer: tiered expiry, tag-based invalidation and single-flight.
//!
//! Compute code only talks to [`CacheStore`]. It decides the tier
//! ([`payvault_core::CacheTtl`]) and the tags a value belongs to; the store
//! takes care of compression, expiry and making sure concurrent misses for
//! one key run the computation once.
//!
//! # Invalidation
//!
//! Keys are never enumerated by naming pattern. Every stored key is
//! registered under its tags in the [`TagIndex`], and
//! [`CacheStore::forget_by_tags`] evicts exactly the keys registered under
//! the given tags.
//!
//! # Example
//!
//! ```ignore
//! let store = CacheStore::in_memory();
//!
//! let overview: SalaryOverview = store
//!     .remember("salary_overview", CacheTtl::Medium, &["salaries", "statistics"],
//!               Duration::from_secs(30), || repo.salary_overview())
//!     .await?;
//!
//! // After a salary write commits:
//! store.forget_by_tags(&["salaries"]).await?;
//! ```

pub mod codec;
pub mod memory_backend;
pub mod single_flight;
pub mod store;
pub mod tag_index;
pub mod traits;

pub use codec::{EncodedPayload, PayloadCodec};
pub use memory_backend::InMemoryCacheBackend;
pub use single_flight::SingleFlight;
pub use store::{CacheStore, Refreshed};
pub use tag_index::{GenerationSnapshot, TagIndex};
pub use traits::{CacheBackend, CacheEntry, CacheStats};
