//! File-backed cache store
//!
//! Stores one JSON document per location key, so entries survive restarts and
//! can be inspected by hand.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CacheEntry, CacheError, CacheStore};
use crate::data::Reading;

/// Persists cache entries to disk
///
/// Entries are JSON files in an XDG-compliant cache directory
/// (`~/.cache/poolcast/weather/` on Linux). Writes go to a temporary file that
/// is renamed over the old entry, and are serialized by a store-wide lock so a
/// read-merge-write cycle never interleaves with another.
#[derive(Debug)]
pub struct FileCacheStore {
    /// Directory where cache files are stored
    cache_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCacheStore {
    /// Creates a store in the XDG cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "poolcast")?;
        Some(Self::with_dir(project_dirs.cache_dir().join("weather")))
    }

    /// Creates a store with a custom cache directory
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Returns the path to a cache file for the given key
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced so keys can never
    /// escape the cache directory.
    fn cache_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{}.json", safe))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.cache_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // A corrupt file is treated as a miss; the next refresh overwrites it
                warn!(location = %key, path = %path.display(), error = %e, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.read_entry(key).await
    }

    async fn upsert(
        &self,
        key: &str,
        readings: &[Reading],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let _guard = self.write_lock.lock().await;

        let mut entry = self
            .read_entry(key)
            .await?
            .unwrap_or_else(|| CacheEntry::new(key));
        entry.merge(readings, fetched_at);

        fs::create_dir_all(&self.cache_dir).await?;
        let json = serde_json::to_string_pretty(&entry)?;
        let path = self.cache_path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        debug!(location = %key, readings = entry.readings.len(), "cache entry written");
        Ok(entry)
    }
}
