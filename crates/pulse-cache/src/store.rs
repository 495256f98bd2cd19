//! Cache backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::error::CacheResult;
use crate::key::CacheKey;

/// Byte-level cache backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<[u8]>>>;

    async fn put(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn invalidate(&self, key: &CacheKey) -> CacheResult<()>;
}

#[derive(Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    ttl: Duration,
}

/// Each entry lives for the TTL it was stored with.
struct EntryTtl;

impl Expiry<CacheKey, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &CacheKey, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache on moka, bounded by entry count.
#[derive(Clone)]
pub struct MokaCacheStore {
    cache: Cache<CacheKey, Entry>,
}

impl MokaCacheStore {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryTtl)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Arc<[u8]>>> {
        Ok(self.cache.get(key).await.map(|e| e.bytes))
    }

    async fn put(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let entry = Entry {
            bytes: value.into(),
            ttl,
        };
        self.cache.insert(key, entry).await;
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
