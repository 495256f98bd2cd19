//! Typed cache façade used by the API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use pulse_core::config::CacheConfig;

use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, CacheKind};
use crate::store::{CacheStore, MokaCacheStore};

/// Time-to-live per entry kind.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub latest: Duration,
    pub stats: Duration,
    pub series: Duration,
}

impl CacheTtls {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            latest: config.latest_ttl(),
            stats: config.stats_ttl(),
            series: config.series_ttl(),
        }
    }

    pub fn for_kind(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Latest => self.latest,
            CacheKind::Stats => self.stats,
            CacheKind::Series => self.series,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// JSON values over a [`CacheStore`], with hit and miss accounting.
pub struct MetricCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl MetricCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self {
            store,
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Moka-backed cache sized and timed from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            Arc::new(MokaCacheStore::new(config.max_entries)),
            CacheTtls::from_config(config),
        )
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> CacheResult<Option<T>> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Decode(format!("{key}: {e}")))
            }
        }
    }

    /// Store a value with the TTL of its kind.
    pub async fn put<T: Serialize>(&self, key: CacheKey, value: &T) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        let ttl = self.ttls.for_kind(key.kind);
        self.store.put(key, bytes, ttl).await.inspect_err(|_| {
            self.errors.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Drop every entry kind of one `(run, metric)` pair. All kinds are
    /// attempted; the first error is returned.
    pub async fn invalidate_metric(&self, run_id: &str, metric_name: &str) -> CacheResult<()> {
        let mut first_err = None;
        for kind in CacheKind::ALL {
            let key = CacheKey::new(run_id, metric_name, kind);
            if let Err(e) = self.store.invalidate(&key).await {
                self.errors.fetch_add(1, Ordering::Relaxed);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(run_id, metric_name, "cache entries invalidated");
                Ok(())
            }
        }
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
