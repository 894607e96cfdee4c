//! Bounded TTL stores.
//!
//! Each node runs two independent stores: the own-region store and the
//! larger foreign-region store. The region label on a request selects the
//! store; entries carry an absolute expiry instant and are treated as absent
//! once past it, with eviction left to the cache.

use axum::body::Bytes;
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const LOCAL_CAPACITY: u64 = 1024;
pub const FOREIGN_CAPACITY: u64 = 4096;

pub const DEFAULT_EXPIRY_SECS: u64 = 3600;
pub const MAX_EXPIRY_SECS: u64 = 99_999_999;

/// Clamp a raw `expiry` query value to `[1, 99_999_999]` seconds; anything
/// unparseable falls back to one hour.
pub fn clamp_expiry(raw: Option<&str>) -> u64 {
    match raw {
        None => DEFAULT_EXPIRY_SECS,
        Some(s) => s
            .parse::<i64>()
            .ok()
            .map(|v| v.clamp(1, MAX_EXPIRY_SECS as i64) as u64)
            .unwrap_or(DEFAULT_EXPIRY_SECS),
    }
}

#[derive(Clone)]
pub struct StoredValue {
    pub bytes: Bytes,
    pub expires_at: Instant,
}

/// Per-entry expiration policy: each value knows its own deadline.
struct PerEntryExpiry;

impl Expiry<String, StoredValue> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// Counters and capacities, served by the diagnostic endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    pub hits: u64,
    pub misses: u64,
    pub maxsize: u64,
    pub currsize: u64,
}

pub struct TtlStore {
    cache: Cache<String, StoredValue>,
    capacity: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryExpiry)
                .build(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch a live entry. Expired-but-not-yet-evicted entries count as
    /// misses and are discarded here.
    pub async fn lookup(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Some(value) if Instant::now() < value.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.bytes)
            }
            Some(_) => {
                self.cache.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn store(&self, key: String, bytes: Bytes, expiry_seconds: u64) {
        let value = StoredValue {
            bytes,
            expires_at: Instant::now() + Duration::from_secs(expiry_seconds),
        };
        self.cache.insert(key, value).await;
    }

    /// Remove an entry, reporting whether a live entry was present.
    pub async fn remove(&self, key: &str) -> bool {
        let found = matches!(
            self.cache.get(key).await,
            Some(value) if Instant::now() < value.expires_at
        );
        self.cache.invalidate(key).await;
        found
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            maxsize: self.capacity,
            currsize: self.cache.entry_count(),
        }
    }
}

/// The pair of stores a node runs, selected by the region label on each
/// request. The label is the caller's, not necessarily this node's.
pub struct RegionStores {
    region: String,
    local: TtlStore,
    foreign: TtlStore,
}

impl RegionStores {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            local: TtlStore::new(LOCAL_CAPACITY),
            foreign: TtlStore::new(FOREIGN_CAPACITY),
        }
    }

    fn select(&self, region: &str) -> &TtlStore {
        if region == self.region {
            &self.local
        } else {
            &self.foreign
        }
    }

    pub async fn lookup(&self, region: &str, key: &str) -> Option<Bytes> {
        self.select(region).lookup(key).await
    }

    pub async fn store(&self, region: &str, key: &str, bytes: Bytes, expiry_seconds: u64) {
        self.select(region)
            .store(key.to_string(), bytes, expiry_seconds)
            .await;
    }

    pub async fn remove(&self, region: &str, key: &str) -> bool {
        self.select(region).remove(key).await
    }

    pub fn local_info(&self) -> CacheInfo {
        self.local.info()
    }

    pub fn foreign_info(&self) -> CacheInfo {
        self.foreign.info()
    }
}
