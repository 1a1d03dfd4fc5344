//! Core data models for poolcast
//!
//! This module contains the data types shared by the cache, the upstream
//! gateway and the orchestration service: pool locations, their coordinates,
//! the time window a refresh covers, and normalized weather readings.

pub mod location;
pub mod weather;

pub use location::{Location, LocationDirectory};
pub use weather::{OpenMeteoGateway, UpstreamGateway};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Geographic position of a pool site
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both components are within valid WGS84 bounds
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Half-open `[start, end)` window of UTC time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window around `now`, truncated to the hour
    ///
    /// Covers `past_hours` before the current hour through `forecast_hours`
    /// after it, matching the hourly resolution providers report at.
    pub fn around(now: DateTime<Utc>, past_hours: u32, forecast_hours: u32) -> Self {
        let hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        Self {
            start: hour - Duration::hours(i64::from(past_hours)),
            end: hour + Duration::hours(i64::from(forecast_hours)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// A single normalized weather observation or forecast hour
///
/// Measurements are optional because providers omit variables they do not
/// model for a given location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Start of the hour this reading describes
    pub timestamp: DateTime<Utc>,
    /// Air temperature in Celsius
    pub temperature: Option<f64>,
    /// UV index
    pub uv_index: Option<f64>,
    /// Precipitation in millimetres
    pub precipitation: Option<f64>,
    /// Wind speed in km/h
    pub wind_speed: Option<f64>,
    /// Relative humidity percentage (0-100)
    pub humidity: Option<f64>,
    /// Surface pressure in hPa
    pub pressure: Option<f64>,
}

impl Reading {
    /// Creates a reading with only a timestamp set
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            temperature: None,
            uv_index: None,
            precipitation: None,
            wind_speed: None,
            humidity: None,
            pressure: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}
