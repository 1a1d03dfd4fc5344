//! Caller-facing error taxonomy
//!
//! `WeatherError` is what the orchestration service returns. The API layer
//! maps it onto an HTTP status and a JSON body with [`WeatherError::status_code`]
//! and [`WeatherError::to_body`], so clients get enough metadata to back off.

use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;

/// The provider refused the request because of rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RateLimitError {
    /// Human-readable description
    pub message: String,
    /// How long the provider asked us to wait
    pub retry_after_seconds: u64,
}

impl RateLimitError {
    pub fn new(retry_after_seconds: u64) -> Self {
        Self {
            message: format!(
                "Weather provider rate limit exceeded. Retry after {} seconds",
                retry_after_seconds
            ),
            retry_after_seconds,
        }
    }
}

/// Errors that can occur when serving weather data
#[derive(Debug, Error)]
pub enum WeatherError {
    /// Transient rate limit from the provider with no cached data to fall back on
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// Any other provider failure: non-2xx status, transport error, bad payload
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// The requested location is not known
    #[error("Location not found: {0}")]
    NotFound(String),

    /// Cache read/write error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// JSON error body returned at the API boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl WeatherError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// HTTP status the API layer should respond with
    pub fn status_code(&self) -> u16 {
        match self {
            WeatherError::RateLimited(_) => 429,
            WeatherError::NotFound(_) => 404,
            WeatherError::Upstream(_) => 502,
            WeatherError::Cache(_) => 500,
        }
    }

    /// Whether a later retry of the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, WeatherError::RateLimited(_) | WeatherError::Upstream(_))
    }

    /// Seconds the caller should wait, when the error carries that hint
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            WeatherError::RateLimited(e) => Some(e.retry_after_seconds),
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let error = match self {
            WeatherError::RateLimited(e) => e.message.clone(),
            WeatherError::NotFound(_) => "Location not found".to_string(),
            WeatherError::Upstream(msg) => msg.clone(),
            WeatherError::Cache(_) => "Internal server error".to_string(),
        };
        ErrorBody {
            error,
            retry_after_seconds: self.retry_after_seconds(),
        }
    }
}
