//! Expiring cache storage
//!
//! `Cache` is a process-wide key/value cache shared between sessions (clone
//! the handle). Entries may carry a deadline; expired entries are invisible to
//! reads and are evicted lazily on access or by `purge_expired`.
//!
//! Deadlines use `tokio::time::Instant` so a paused test clock drives expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{StorageFuture, TokenStorage};

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Shared in-process cache with optional per-entry expiry.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; `ttl = None` keeps it until forgotten.
    pub async fn put(&self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key, CacheEntry { value, expires_at });
    }

    /// Read a live value, evicting it if it has expired.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn forget(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "purged expired cache entries");
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// `TokenStorage` over a shared `Cache`, with a key prefix and optional TTL
/// applied to every write.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    cache: Cache,
    prefix: String,
    ttl: Option<Duration>,
}

impl CacheStorage {
    pub fn new(cache: Cache, prefix: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl TokenStorage for CacheStorage {
    fn id(&self) -> &str {
        "cache"
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.cache
                .put(self.key(key), value.to_owned(), self.ttl)
                .await;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.cache.get(&self.key(key)).await) })
    }

    fn forget<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.cache.forget(&self.key(key)).await;
            Ok(())
        })
    }

    fn commit(&self) -> StorageFuture<'_, ()> {
        // Cache writes are visible immediately
        Box::pin(async { Ok(()) })
    }
}
