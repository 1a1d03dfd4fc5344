//! Cache freshness policy
//!
//! Decides whether a cache entry can be served as-is or must be refreshed
//! from the provider. Pure: no clock reads, no I/O.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of evaluating a cache entry's age against a TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Young enough to serve without contacting the provider
    Fresh,
    /// Never fetched, or at least `ttl` old
    Stale,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// Evaluates freshness of data last fetched at `last_fetch_at`
///
/// Returns `Fresh` only when a fetch timestamp exists and `now - last_fetch_at < ttl`.
/// A timestamp in the future has a negative age and is therefore fresh.
pub fn evaluate(last_fetch_at: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> Freshness {
    let Some(last) = last_fetch_at else {
        return Freshness::Stale;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        // TTL too large to represent: nothing can ever be old enough
        return Freshness::Fresh;
    };

    if now - last < ttl {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}
