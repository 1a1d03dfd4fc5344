//! Open-Meteo upstream gateway
//!
//! This module fetches hourly weather from the Open-Meteo API and normalizes
//! it into [`Reading`]s. Rate-limit responses are surfaced as a distinct
//! [`RateLimitError`] so the caller can fall back to cached data.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Coordinates, Reading, TimeRange};
use crate::error::{RateLimitError, WeatherError};

/// Base URL for the Open-Meteo API
pub const OPEN_METEO_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Used when a 429 response carries no usable `Retry-After` header
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Hourly variables requested from the provider
const HOURLY_VARIABLES: &str =
    "temperature_2m,uv_index,precipitation,wind_speed_10m,relative_humidity_2m,surface_pressure";

/// Hour format used by Open-Meteo for both request bounds and response times
const HOUR_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Source of fresh weather readings
///
/// Fails with [`WeatherError::RateLimited`] when the provider throttles us and
/// with [`WeatherError::Upstream`] for every other failure. Implementations
/// must not mutate any local state.
#[async_trait]
pub trait UpstreamGateway: Send + Sync {
    async fn fetch(
        &self,
        location_key: &str,
        coordinates: Coordinates,
        range: TimeRange,
    ) -> Result<Vec<Reading>, WeatherError>;
}

/// Client for fetching hourly readings from Open-Meteo
#[derive(Debug, Clone)]
pub struct OpenMeteoGateway {
    client: Client,
    base_url: String,
    default_retry_after_secs: u64,
}

impl OpenMeteoGateway {
    /// Create a gateway with a request timeout
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("poolcast/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Create a gateway with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: OPEN_METEO_BASE_URL.to_string(),
            default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }
    }

    /// Point the gateway at a different endpoint (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_retry_after(mut self, seconds: u64) -> Self {
        self.default_retry_after_secs = seconds;
        self
    }

    fn rate_limit_error(&self, headers: &HeaderMap) -> RateLimitError {
        let retry_after = parse_retry_after(headers, Utc::now())
            .unwrap_or(self.default_retry_after_secs);
        RateLimitError::new(retry_after)
    }
}

#[async_trait]
impl UpstreamGateway for OpenMeteoGateway {
    async fn fetch(
        &self,
        location_key: &str,
        coordinates: Coordinates,
        range: TimeRange,
    ) -> Result<Vec<Reading>, WeatherError> {
        // end_hour is inclusive on the provider side
        let last_hour = range.end - chrono::Duration::hours(1);
        let query = [
            ("latitude", coordinates.latitude.to_string()),
            ("longitude", coordinates.longitude.to_string()),
            ("hourly", HOURLY_VARIABLES.to_string()),
            ("start_hour", range.start.format(HOUR_FORMAT).to_string()),
            ("end_hour", last_hour.format(HOUR_FORMAT).to_string()),
            ("timezone", "GMT".to_string()),
        ];

        debug!(
            location = %location_key,
            lat = coordinates.latitude,
            lon = coordinates.longitude,
            "fetching hourly weather from {}",
            self.base_url
        );

        let response = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| WeatherError::upstream(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let err = self.rate_limit_error(response.headers());
            warn!(
                location = %location_key,
                retry_after_seconds = err.retry_after_seconds,
                "weather provider rate limited request"
            );
            return Err(err.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WeatherError::upstream(format!(
                "Weather provider returned {}: {}",
                status,
                truncate(&body, 300)
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| WeatherError::upstream(format!("Failed to read response body: {}", e)))?;
        let payload: OpenMeteoResponse = serde_json::from_str(&text)
            .map_err(|e| WeatherError::upstream(format!("Failed to parse JSON response: {}", e)))?;

        let readings = parse_hourly(&payload.hourly, range)?;
        debug!(location = %location_key, readings = readings.len(), "weather fetch succeeded");
        Ok(readings)
    }
}

/// Parse a `Retry-After` header into seconds from `now`
///
/// Accepts both delta-seconds (`"120"`) and HTTP dates
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Dates in the past yield zero.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    if let Ok(seconds) = raw.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(seconds.ceil() as u64);
        }
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).num_seconds().max(0) as u64)
}

/// Zip Open-Meteo's column arrays into readings within `range`
fn parse_hourly(hourly: &HourlyColumns, range: TimeRange) -> Result<Vec<Reading>, WeatherError> {
    let len = hourly.time.len();
    let columns = [
        ("temperature_2m", &hourly.temperature_2m),
        ("uv_index", &hourly.uv_index),
        ("precipitation", &hourly.precipitation),
        ("wind_speed_10m", &hourly.wind_speed_10m),
        ("relative_humidity_2m", &hourly.relative_humidity_2m),
        ("surface_pressure", &hourly.surface_pressure),
    ];
    // A column the provider omitted entirely is allowed; a partial one is not
    for (name, column) in columns {
        if !column.is_empty() && column.len() != len {
            return Err(WeatherError::upstream(format!(
                "hourly column {} has {} values, expected {}",
                name,
                column.len(),
                len
            )));
        }
    }

    let value = |column: &Vec<Option<f64>>, i: usize| column.get(i).copied().flatten();

    let mut readings = Vec::with_capacity(len);
    for (i, raw_time) in hourly.time.iter().enumerate() {
        let timestamp = parse_hour(raw_time)?;
        if !range.contains(timestamp) {
            continue;
        }
        readings.push(Reading {
            timestamp,
            temperature: value(&hourly.temperature_2m, i),
            uv_index: value(&hourly.uv_index, i),
            precipitation: value(&hourly.precipitation, i),
            wind_speed: value(&hourly.wind_speed_10m, i),
            humidity: value(&hourly.relative_humidity_2m, i),
            pressure: value(&hourly.surface_pressure, i),
        });
    }

    Ok(readings)
}

/// Parse an hour string (e.g., "2024-07-15T05:00") reported in GMT
fn parse_hour(raw: &str) -> Result<DateTime<Utc>, WeatherError> {
    NaiveDateTime::parse_from_str(raw, HOUR_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| WeatherError::upstream(format!("Invalid time format: {}", raw)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Open-Meteo API response structure
#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: HourlyColumns,
}

/// Hourly weather columns from Open-Meteo; `null` entries become `None`
#[derive(Debug, Deserialize)]
struct HourlyColumns {
    time: Vec<String>,
    #[serde(default)]
    temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    uv_index: Vec<Option<f64>>,
    #[serde(default)]
    precipitation: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_10m: Vec<Option<f64>>,
    #[serde(default)]
    relative_humidity_2m: Vec<Option<f64>>,
    #[serde(default)]
    surface_pressure: Vec<Option<f64>>,
}
