//! Dead letter persistence

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{DeadLetter, DeadLetterStatus};

/// Errors raised by dead letter stores
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// Filesystem read/write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue file could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `save` was called for an entry that was never enqueued
    #[error("Dead letter not found: {0}")]
    NotFound(Uuid),
}

/// Storage for dead letters
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn enqueue(&self, entry: DeadLetter) -> Result<(), DeadLetterError>;

    /// Pending entries with `next_attempt_at <= now`, soonest first, at most `limit`
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Replaces a previously enqueued entry
    async fn save(&self, entry: &DeadLetter) -> Result<(), DeadLetterError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError>;

    /// All entries, oldest first
    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError>;

    async fn list_by_status(&self, status: DeadLetterStatus) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    /// The pending entry for `operation` on `key`, if one is queued
    async fn find_pending(&self, operation: &str, key: &str) -> Result<Option<DeadLetter>, DeadLetterError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|e| e.status == DeadLetterStatus::Pending && e.operation == operation && e.key == key))
    }
}

fn select_due(entries: impl Iterator<Item = DeadLetter>, now: DateTime<Utc>, limit: usize) -> Vec<DeadLetter> {
    let mut due: Vec<DeadLetter> = entries.filter(|e| e.is_due(now)).collect();
    due.sort_by(|a, b| {
        a.next_attempt_at
            .cmp(&b.next_attempt_at)
            .then(a.created_at.cmp(&b.created_at))
    });
    due.truncate(limit);
    due
}

fn sort_oldest_first(mut entries: Vec<DeadLetter>) -> Vec<DeadLetter> {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    entries
}

/// In-process dead letter store
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: RwLock<HashMap<Uuid, DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn enqueue(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let entries = self.entries.read().await;
        Ok(select_due(entries.values().cloned(), now, limit))
    }

    async fn save(&self, entry: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&entry.id) {
            Some(slot) => {
                *slot = entry.clone();
                Ok(())
            }
            None => Err(DeadLetterError::NotFound(entry.id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let entries = self.entries.read().await;
        Ok(sort_oldest_first(entries.values().cloned().collect()))
    }
}

/// Dead letter queue kept in a single JSON file
///
/// Every mutation rewrites the file through a temporary file and a rename,
/// under a store-wide lock.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDeadLetterStore {
    /// Creates a store in the XDG data directory
    /// (`~/.local/share/poolcast/dead_letters.json` on Linux)
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "poolcast")?;
        Some(Self::with_path(project_dirs.data_dir().join("dead_letters.json")))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, entries: &[DeadLetter]) -> Result<(), DeadLetterError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn enqueue(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
        self.write_all(&entries).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let _guard = self.lock.lock().await;
        Ok(select_due(self.read_all().await?.into_iter(), now, limit))
    }

    async fn save(&self, entry: &DeadLetter) -> Result<(), DeadLetterError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or(DeadLetterError::NotFound(entry.id))?;
        *slot = entry.clone();
        self.write_all(&entries).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.into_iter().find(|e| e.id == id))
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let _guard = self.lock.lock().await;
        Ok(sort_oldest_first(self.read_all().await?))
    }
}
