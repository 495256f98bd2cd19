//! pulse-cache: read cache for latest values and statistics.
//!
//! Entries are keyed by `(run_id, metric_name, kind)` and expire after a
//! per-kind TTL. The cache is never authoritative: callers treat any error
//! as a miss and read through to storage.

pub mod cache;
pub mod error;
pub mod key;
pub mod store;

pub use cache::{CacheCounters, CacheTtls, MetricCache};
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, CacheKind};
pub use store::{CacheStore, MokaCacheStore};
