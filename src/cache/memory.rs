//! In-process cache store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CacheEntry, CacheError, CacheStore};
use crate::data::Reading;

/// Cache store backed by a `HashMap` behind an async `RwLock`
///
/// Reads share the lock; each upsert holds the write lock for its whole
/// merge, which makes it atomic per key.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry as-is, replacing anything cached for its key
    pub async fn seed(&self, entry: CacheEntry) {
        self.entries
            .write()
            .await
            .insert(entry.location_key.clone(), entry);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &str,
        readings: &[Reading],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(key));
        entry.merge(readings, fetched_at);
        Ok(entry.clone())
    }
}
