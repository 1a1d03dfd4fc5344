//! Cache module for storing the latest known-good weather readings
//!
//! Every location key owns one [`CacheEntry`]: the readings merged from all
//! successful refreshes and the time of the last successful fetch. Entries are
//! only written after the provider answered successfully, so a failed refresh
//! never disturbs what is already cached.
//!
//! Two stores are provided: [`FileCacheStore`] persists entries as JSON files
//! in an XDG-compliant cache directory, and [`MemoryCacheStore`] keeps them in
//! process.

mod manager;
mod memory;

pub use manager::FileCacheStore;
pub use memory::MemoryCacheStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Reading;

/// Errors raised by cache stores
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem read/write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cached readings for one location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Location the readings belong to
    pub location_key: String,
    /// Readings ordered by timestamp, at most one per timestamp
    pub readings: Vec<Reading>,
    /// When the provider last answered successfully for this key
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(location_key: impl Into<String>) -> Self {
        Self {
            location_key: location_key.into(),
            readings: Vec::new(),
            last_fetch_at: None,
        }
    }

    pub fn has_readings(&self) -> bool {
        !self.readings.is_empty()
    }

    /// Merges freshly fetched readings and records the fetch time
    ///
    /// Readings are keyed by timestamp; an incoming reading replaces a cached
    /// one with the same timestamp.
    pub fn merge(&mut self, incoming: &[Reading], fetched_at: DateTime<Utc>) {
        let mut by_time: BTreeMap<DateTime<Utc>, Reading> = self
            .readings
            .drain(..)
            .map(|r| (r.timestamp, r))
            .collect();
        for reading in incoming {
            by_time.insert(reading.timestamp, reading.clone());
        }
        self.readings = by_time.into_values().collect();
        self.last_fetch_at = Some(fetched_at);
    }
}

/// Storage for the latest known-good readings per location
///
/// Implementations must accept concurrent reads and apply `upsert` atomically
/// per key so interleaved writers never leave a partially merged entry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the entry for `key`, or `None` if nothing was ever cached
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Merges `readings` into the entry for `key` and sets its last fetch time
    ///
    /// Creates the entry on first write. Returns the entry as stored.
    async fn upsert(
        &self,
        key: &str,
        readings: &[Reading],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, h, 0, 0).unwrap()
    }

    #[test]
    fn test_merge_orders_readings_by_timestamp() {
        let mut entry = CacheEntry::new("kits-pool");
        entry.merge(
            &[Reading::at(hour(3)), Reading::at(hour(1)), Reading::at(hour(2))],
            hour(4),
        );

        let times: Vec<_> = entry.readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![hour(1), hour(2), hour(3)]);
        assert_eq!(entry.last_fetch_at, Some(hour(4)));
    }

    #[test]
    fn test_merge_last_write_wins_per_timestamp() {
        let mut entry = CacheEntry::new("kits-pool");
        entry.merge(
            &[
                Reading::at(hour(1)).with_temperature(18.0),
                Reading::at(hour(2)).with_temperature(19.0),
            ],
            hour(2),
        );
        entry.merge(&[Reading::at(hour(2)).with_temperature(21.5)], hour(3));

        assert_eq!(entry.readings.len(), 2);
        assert_eq!(entry.readings[0].temperature, Some(18.0));
        assert_eq!(entry.readings[1].temperature, Some(21.5));
        assert_eq!(entry.last_fetch_at, Some(hour(3)));
    }

    #[test]
    fn test_merge_with_no_readings_still_records_fetch() {
        let mut entry = CacheEntry::new("kits-pool");
        entry.merge(&[], hour(5));

        assert!(!entry.has_readings());
        assert_eq!(entry.last_fetch_at, Some(hour(5)));
    }
}
