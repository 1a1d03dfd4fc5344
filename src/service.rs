//! Get-or-refresh orchestration for weather data
//!
//! [`WeatherService::get_data`] serves cached readings while they are fresh,
//! refreshes them from the provider once they go stale, and falls back to
//! stale readings when the provider rate limits us. Concurrent stale requests
//! for the same location are coalesced behind a per-key lock so only one of
//! them reaches the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::data::{Location, LocationDirectory, Reading, TimeRange, UpstreamGateway};
use crate::error::WeatherError;
use crate::freshness::{self, Freshness};

/// Default cache TTL (30 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Where the readings in a [`Forecast`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Served from a fresh cache entry
    Cache,
    /// Fetched from the provider just now
    Upstream,
    /// Provider rate limited us; these are the last known-good readings
    StaleFallback,
}

/// Readings returned to a caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub location_key: String,
    pub readings: Vec<Reading>,
    /// When the provider last answered successfully for this location
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub origin: Origin,
}

impl Forecast {
    fn from_entry(entry: CacheEntry, origin: Origin) -> Self {
        Self {
            location_key: entry.location_key,
            readings: entry.readings,
            last_fetch_at: entry.last_fetch_at,
            origin,
        }
    }

    /// Whether the caller is getting stale data instead of an error
    pub fn is_degraded(&self) -> bool {
        self.origin == Origin::StaleFallback
    }
}

/// Weather cache orchestration over a cache store and an upstream gateway
pub struct WeatherService {
    locations: LocationDirectory,
    cache: Arc<dyn CacheStore>,
    gateway: Arc<dyn UpstreamGateway>,
    ttl: Duration,
    past_hours: u32,
    forecast_hours: u32,
    /// One lock per key with a refresh in progress
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WeatherService {
    pub fn new(
        locations: LocationDirectory,
        cache: Arc<dyn CacheStore>,
        gateway: Arc<dyn UpstreamGateway>,
    ) -> Self {
        Self {
            locations,
            cache,
            gateway,
            ttl: DEFAULT_CACHE_TTL,
            past_hours: 0,
            forecast_hours: 48,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set how many hours before and after now each refresh requests
    pub fn with_window(mut self, past_hours: u32, forecast_hours: u32) -> Self {
        self.past_hours = past_hours;
        self.forecast_hours = forecast_hours;
        self
    }

    pub fn locations(&self) -> &LocationDirectory {
        &self.locations
    }

    /// Returns readings for `key`, refreshing them if the cache is stale
    ///
    /// Only a rate limit with cached readings available is absorbed (the
    /// result is flagged [`Origin::StaleFallback`]). Every other failure,
    /// including a generic upstream error, is returned to the caller.
    pub async fn get_data(&self, key: &str, now: DateTime<Utc>) -> Result<Forecast, WeatherError> {
        let location = self.locate(key)?;

        if let Some(entry) = self.cache.load(key).await? {
            if self.freshness(&entry, now).is_fresh() {
                debug!(location = %key, "serving fresh cache entry");
                return Ok(Forecast::from_entry(entry, Origin::Cache));
            }
        }

        let slot = self.acquire_slot(key).await;
        let result = {
            let _guard = slot.lock().await;
            self.get_data_locked(&location, now).await
        };
        self.release_slot(key, slot).await;
        result
    }

    /// Fetches from the provider and updates the cache, ignoring freshness
    ///
    /// Used by retry handlers: there is no stale fallback, so a rate limit
    /// is always reported as an error.
    pub async fn refresh(&self, key: &str, now: DateTime<Utc>) -> Result<Forecast, WeatherError> {
        let location = self.locate(key)?;

        let slot = self.acquire_slot(key).await;
        let result = {
            let _guard = slot.lock().await;
            self.fetch_and_store(&location, now).await
        };
        self.release_slot(key, slot).await;
        result
    }

    async fn get_data_locked(&self, location: &Location, now: DateTime<Utc>) -> Result<Forecast, WeatherError> {
        let key = location.id.as_str();

        // Another caller may have refreshed the entry while we waited for the lock
        let cached = self.cache.load(key).await?;
        if let Some(entry) = &cached {
            if self.freshness(entry, now).is_fresh() {
                debug!(location = %key, "refresh coalesced with concurrent caller");
                return Ok(Forecast::from_entry(entry.clone(), Origin::Cache));
            }
        }

        match self.fetch_and_store(location, now).await {
            Ok(forecast) => Ok(forecast),
            Err(WeatherError::RateLimited(err)) => match cached {
                Some(entry) if entry.has_readings() => {
                    warn!(
                        location = %key,
                        retry_after_seconds = err.retry_after_seconds,
                        last_fetch_at = ?entry.last_fetch_at,
                        "rate limited, serving stale cache"
                    );
                    Ok(Forecast::from_entry(entry, Origin::StaleFallback))
                }
                _ => Err(err.into()),
            },
            Err(err) => Err(err),
        }
    }

    async fn fetch_and_store(&self, location: &Location, now: DateTime<Utc>) -> Result<Forecast, WeatherError> {
        let key = location.id.as_str();
        let range = TimeRange::around(now, self.past_hours, self.forecast_hours);

        let readings = self
            .gateway
            .fetch(key, location.coordinates(), range)
            .await?;
        let entry = self.cache.upsert(key, &readings, now).await?;

        info!(location = %key, readings = readings.len(), "weather refreshed");
        Ok(Forecast {
            location_key: entry.location_key,
            readings,
            last_fetch_at: entry.last_fetch_at,
            origin: Origin::Upstream,
        })
    }

    fn locate(&self, key: &str) -> Result<Location, WeatherError> {
        self.locations
            .get(key)
            .cloned()
            .ok_or_else(|| WeatherError::NotFound(key.to_string()))
    }

    fn freshness(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Freshness {
        freshness::evaluate(entry.last_fetch_at, self.ttl, now)
    }

    async fn acquire_slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn release_slot(&self, key: &str, slot: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // Slots are only cloned under this lock, so a count of two means the
        // map and this caller are the last holders
        if Arc::strong_count(&slot) == 2 {
            in_flight.remove(key);
        }
    }
}
