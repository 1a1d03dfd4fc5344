//! Dead letter records and their state transitions

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a dead letter
///
/// `Pending` entries are retried; `Resolved` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Resolved,
    Dead,
}

impl DeadLetterStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeadLetterStatus::Pending)
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeadLetterStatus::Pending),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "dead" => Ok(DeadLetterStatus::Dead),
            other => Err(format!(
                "Invalid status: '{}'. Valid statuses: pending, resolved, dead",
                other
            )),
        }
    }
}

/// A failed unit of work waiting to be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    /// Which handler retries this entry (e.g. `weather_refresh`)
    pub operation: String,
    /// Subject of the operation, such as a location key
    pub key: String,
    /// Operation-specific details
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Retries attempted so far
    pub attempts: u32,
    pub status: DeadLetterStatus,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a pending entry that is due immediately
    pub fn new(operation: impl Into<String>, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            key: key.into(),
            payload: serde_json::Value::Null,
            attempts: 0,
            status: DeadLetterStatus::Pending,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Records the failure that caused the entry to be created
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Delays the first retry until `at`
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = at;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeadLetterStatus::Pending && self.next_attempt_at <= now
    }

    /// Marks a successful retry
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.attempts += 1;
        self.status = DeadLetterStatus::Resolved;
        self.updated_at = now;
    }

    /// Records a failed retry and returns the resulting status
    ///
    /// The entry goes `Dead` once `attempts` reaches `max_attempts`; otherwise
    /// it is rescheduled `delay` after `now`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        max_attempts: u32,
        delay: Duration,
    ) -> DeadLetterStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.attempts >= max_attempts {
            self.status = DeadLetterStatus::Dead;
        } else {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            self.next_attempt_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
        self.status
    }

    /// Gives up on the entry without further retries
    pub fn mark_dead(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.status = DeadLetterStatus::Dead;
        self.updated_at = now;
    }
}
