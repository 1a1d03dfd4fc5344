//! Background weather refresh
//!
//! Periodically walks every configured location through
//! [`WeatherService::get_data`] so the cache stays warm, and reports progress
//! over a tokio channel. Refreshes that fail are recorded as dead letters and
//! retried by the [`RetryWorker`](crate::dead_letter::RetryWorker) through
//! [`WeatherRefreshHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetter, DeadLetterStore, PermanentFailure, RetryError, RetryHandler};
use crate::error::WeatherError;
use crate::service::{Origin, WeatherService};

/// Dead letter operation tag for failed weather refreshes
pub const WEATHER_REFRESH_OPERATION: &str = "weather_refresh";

/// Messages sent from the background refresh to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshMessage {
    /// Refresh sweep started
    RefreshStarted,
    /// Readings for a location are available
    ForecastUpdated {
        location_key: String,
        origin: Origin,
        readings: usize,
    },
    /// Refreshing a location failed
    RefreshError { location_key: String, error: String },
    /// Refresh sweep completed
    RefreshCompleted,
}

/// Configuration for the refresh sweep
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Interval between sweeps
    pub interval: Duration,
    /// Whether auto-refresh is enabled
    pub enabled: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900), // 15 minutes
            enabled: true,
        }
    }
}

/// Handle for controlling the background refresh sweep
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    /// Signals the sweep loop to exit
    shutdown_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Spawns the background sweep
    ///
    /// The first sweep runs one interval after spawning. When refresh is
    /// disabled no task is started and the receiver never yields.
    pub fn spawn(
        config: RefreshConfig,
        service: Arc<WeatherService>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = if config.enabled {
            let interval = config.interval;
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // Skip the first tick (immediate)
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            sweep(&service, dead_letters.as_ref(), &msg_tx, Utc::now()).await;
                        }
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                    }
                }
                debug!("refresh sweep loop exited");
            }))
        } else {
            None
        };

        Self {
            receiver: msg_rx,
            shutdown_tx,
            task,
        }
    }

    /// Stops the sweep, letting an in-flight sweep finish first
    ///
    /// Messages still unread are discarded.
    pub async fn shutdown(mut self) {
        self.receiver.close();
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "refresh task ended abnormally");
            }
        }
    }
}

/// Checks for pending refresh messages without blocking
pub fn try_recv(handle: &mut RefreshHandle) -> Option<RefreshMessage> {
    handle.receiver.try_recv().ok()
}

/// Refreshes every configured location once
///
/// Locations are refreshed concurrently. A failed refresh is dead-lettered:
/// upstream errors are due immediately, rate limits after the provider's
/// retry-after. Unknown locations are not retried. Progress messages are
/// dropped when the channel is full so a slow reader never stalls the sweep.
pub async fn sweep(
    service: &WeatherService,
    dead_letters: &dyn DeadLetterStore,
    tx: &mpsc::Sender<RefreshMessage>,
    now: DateTime<Utc>,
) {
    notify(tx, RefreshMessage::RefreshStarted);

    let keys: Vec<String> = service.locations().all().iter().map(|l| l.id.clone()).collect();
    let results = join_all(keys.iter().map(|key| service.get_data(key, now))).await;

    for (key, result) in keys.into_iter().zip(results) {
        let message = match result {
            Ok(forecast) => RefreshMessage::ForecastUpdated {
                location_key: key,
                origin: forecast.origin,
                readings: forecast.readings.len(),
            },
            Err(err) => {
                record_failure(dead_letters, &key, &err, now).await;
                RefreshMessage::RefreshError {
                    location_key: key,
                    error: err.to_string(),
                }
            }
        };
        notify(tx, message);
    }

    notify(tx, RefreshMessage::RefreshCompleted);
}

fn notify(tx: &mpsc::Sender<RefreshMessage>, message: RefreshMessage) {
    if let Err(e) = tx.try_send(message) {
        debug!(error = %e, "refresh message dropped");
    }
}

/// `now + seconds`, saturating at the latest representable time
fn retry_at(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let delay = chrono::Duration::try_seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Queues a retry for `key`, or updates the one already pending
async fn record_failure(dead_letters: &dyn DeadLetterStore, key: &str, err: &WeatherError, now: DateTime<Utc>) {
    let due_at = match err {
        WeatherError::RateLimited(e) => retry_at(now, e.retry_after_seconds),
        WeatherError::Upstream(_) => now,
        WeatherError::NotFound(_) | WeatherError::Cache(_) => {
            warn!(location = %key, error = %err, "refresh failed, not retrying");
            return;
        }
    };

    let existing = match dead_letters.find_pending(WEATHER_REFRESH_OPERATION, key).await {
        Ok(existing) => existing,
        Err(e) => {
            error!(location = %key, error = %e, "failed to look up queued refresh");
            return;
        }
    };

    let result = match existing {
        Some(mut entry) => {
            entry.last_error = Some(err.to_string());
            entry.next_attempt_at = entry.next_attempt_at.max(due_at);
            entry.updated_at = now;
            debug!(location = %key, id = %entry.id, "refresh still failing, retry already queued");
            dead_letters.save(&entry).await
        }
        None => {
            let entry = DeadLetter::new(WEATHER_REFRESH_OPERATION, key, now)
                .with_error(err.to_string())
                .due_at(due_at);
            info!(location = %key, error = %err, "refresh failed, queued for retry");
            dead_letters.enqueue(entry).await
        }
    };
    if let Err(e) = result {
        error!(location = %key, error = %e, "failed to queue refresh for retry");
    }
}

/// Retries failed refreshes by forcing a fresh fetch
pub struct WeatherRefreshHandler {
    service: Arc<WeatherService>,
}

impl WeatherRefreshHandler {
    pub fn new(service: Arc<WeatherService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RetryHandler for WeatherRefreshHandler {
    async fn retry(&self, entry: &DeadLetter, now: DateTime<Utc>) -> Result<(), RetryError> {
        match self.service.refresh(&entry.key, now).await {
            Ok(_) => Ok(()),
            Err(WeatherError::NotFound(key)) => Err(Box::new(PermanentFailure(format!("location {} no longer exists", key)))),
            Err(e) => Err(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::data::{Coordinates, Location, LocationDirectory, Reading, TimeRange, UpstreamGateway};
    use crate::dead_letter::{DeadLetterStatus, MemoryDeadLetterStore, RetryWorker, WorkerConfig};
    use crate::error::RateLimitError;
    use chrono::TimeZone;

    /// Fails for one location key, succeeds for the rest
    struct SelectiveGateway {
        failing: String,
        error: fn() -> WeatherError,
    }

    #[async_trait]
    impl UpstreamGateway for SelectiveGateway {
        async fn fetch(&self, key: &str, _c: Coordinates, range: TimeRange) -> Result<Vec<Reading>, WeatherError> {
            if key == self.failing {
                Err((self.error)())
            } else {
                Ok(vec![Reading::at(range.start).with_temperature(21.0)])
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    fn service(failing: &str, error: fn() -> WeatherError) -> Arc<WeatherService> {
        service_for(
            vec![
                Location::new("kits-pool", "Kitsilano Pool", 49.27, -123.15),
                Location::new("trout-lake", "Trout Lake Pool", 49.25, -123.06),
            ],
            failing,
            error,
        )
    }

    fn service_for(locations: Vec<Location>, failing: &str, error: fn() -> WeatherError) -> Arc<WeatherService> {
        let locations = LocationDirectory::new(locations);
        let gateway = Arc::new(SelectiveGateway {
            failing: failing.to_string(),
            error,
        });
        Arc::new(WeatherService::new(locations, Arc::new(MemoryCacheStore::new()), gateway))
    }

    async fn drain(rx: &mut mpsc::Receiver<RefreshMessage>) -> Vec<RefreshMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[test]
    fn test_refresh_config_default() {
        let config = RefreshConfig::default();
        assert_eq!(config.interval, Duration::from_secs(900));
        assert!(config.enabled);
    }

    #[tokio::test]
    async fn test_sweep_reports_each_location() {
        let svc = service("trout-lake", || WeatherError::upstream("503"));
        let store = MemoryDeadLetterStore::new();
        let (tx, mut rx) = mpsc::channel(32);

        sweep(&svc, &store, &tx, now()).await;

        let messages = drain(&mut rx).await;
        assert_eq!(messages.first(), Some(&RefreshMessage::RefreshStarted));
        assert_eq!(messages.last(), Some(&RefreshMessage::RefreshCompleted));
        assert!(messages.contains(&RefreshMessage::ForecastUpdated {
            location_key: "kits-pool".to_string(),
            origin: Origin::Upstream,
            readings: 1,
        }));
        assert!(messages
            .iter()
            .any(|m| matches!(m, RefreshMessage::RefreshError { location_key, .. } if location_key == "trout-lake")));
    }

    #[tokio::test]
    async fn test_sweep_dead_letters_upstream_failure_due_now() {
        let svc = service("trout-lake", || WeatherError::upstream("503"));
        let store = MemoryDeadLetterStore::new();
        let (tx, _rx) = mpsc::channel(32);

        sweep(&svc, &store, &tx, now()).await;

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "trout-lake");
        assert_eq!(entries[0].operation, WEATHER_REFRESH_OPERATION);
        assert!(entries[0].is_due(now()));
    }

    #[tokio::test]
    async fn test_sweep_delays_rate_limited_retry() {
        let svc = service("kits-pool", || RateLimitError::new(120).into());
        let store = MemoryDeadLetterStore::new();
        let (tx, _rx) = mpsc::channel(32);

        sweep(&svc, &store, &tx, now()).await;

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].next_attempt_at, now() + chrono::Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_sweep_saturates_huge_retry_after() {
        let svc = service("kits-pool", || RateLimitError::new(10_000_000_000_000).into());
        let store = MemoryDeadLetterStore::new();
        let (tx, _rx) = mpsc::channel(32);

        sweep(&svc, &store, &tx, now()).await;

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].next_attempt_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_retry_at_clamps_out_of_range_delays() {
        assert_eq!(retry_at(now(), 90), now() + chrono::Duration::seconds(90));
        assert_eq!(retry_at(now(), u64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_repeated_failures_keep_one_pending_entry() {
        let svc = service("trout-lake", || WeatherError::upstream("503"));
        let store = MemoryDeadLetterStore::new();
        let (tx, _rx) = mpsc::channel(32);

        for sweep_no in 0..3 {
            sweep(&svc, &store, &tx, now() + chrono::Duration::minutes(15 * sweep_no)).await;
        }

        let pending = store.list_by_status(DeadLetterStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "trout-lake");
        assert_eq!(pending[0].created_at, now());
        assert_eq!(pending[0].updated_at, now() + chrono::Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_new_failure_queued_after_previous_entry_resolved() {
        let svc = service("trout-lake", || WeatherError::upstream("503"));
        let store = MemoryDeadLetterStore::new();
        let (tx, _rx) = mpsc::channel(32);

        sweep(&svc, &store, &tx, now()).await;
        let mut first = store.list().await.unwrap().remove(0);
        first.resolve(now());
        store.save(&first).await.unwrap();
        sweep(&svc, &store, &tx, now() + chrono::Duration::minutes(15)).await;

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.list_by_status(DeadLetterStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_unread_messages_does_not_hang() {
        let locations = (0..40)
            .map(|i| Location::new(format!("pool-{}", i), format!("Pool {}", i), 49.0, -123.0))
            .collect();
        let svc = service_for(locations, "nobody", || WeatherError::upstream("unused"));
        let config = RefreshConfig {
            interval: Duration::from_millis(10),
            enabled: true,
        };

        let handle = RefreshHandle::spawn(config, svc, Arc::new(MemoryDeadLetterStore::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown should not wait on an unread channel");
    }

    #[tokio::test]
    async fn test_handler_uses_tick_time() {
        let svc = service("nobody", || WeatherError::upstream("unused"));
        let store = Arc::new(MemoryDeadLetterStore::new());
        store
            .enqueue(DeadLetter::new(WEATHER_REFRESH_OPERATION, "kits-pool", now()))
            .await
            .unwrap();
        let worker = RetryWorker::builder(store.clone(), WorkerConfig::default())
            .handler(WEATHER_REFRESH_OPERATION, Arc::new(WeatherRefreshHandler::new(svc.clone())))
            .build();

        worker.run_once(now()).await;

        let forecast = svc.get_data("kits-pool", now()).await.unwrap();
        assert_eq!(forecast.origin, Origin::Cache);
        assert_eq!(forecast.last_fetch_at, Some(now()));
    }

    #[tokio::test]
    async fn test_handler_resolves_dead_letter_through_worker() {
        let svc = service("nobody", || WeatherError::upstream("unused"));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let entry = DeadLetter::new(WEATHER_REFRESH_OPERATION, "kits-pool", now());
        let id = entry.id;
        store.enqueue(entry).await.unwrap();
        let worker = RetryWorker::builder(store.clone(), WorkerConfig::default())
            .handler(WEATHER_REFRESH_OPERATION, Arc::new(WeatherRefreshHandler::new(svc)))
            .build();

        worker.run_once(now()).await;

        assert_eq!(store.get(id).await.unwrap().unwrap().status, DeadLetterStatus::Resolved);
    }

    #[tokio::test]
    async fn test_handler_marks_unknown_location_dead() {
        let svc = service("nobody", || WeatherError::upstream("unused"));
        let store = Arc::new(MemoryDeadLetterStore::new());
        let entry = DeadLetter::new(WEATHER_REFRESH_OPERATION, "demolished-pool", now());
        let id = entry.id;
        store.enqueue(entry).await.unwrap();
        let worker = RetryWorker::builder(store.clone(), WorkerConfig::default())
            .handler(WEATHER_REFRESH_OPERATION, Arc::new(WeatherRefreshHandler::new(svc)))
            .build();

        worker.run_once(now()).await;

        assert_eq!(store.get(id).await.unwrap().unwrap().status, DeadLetterStatus::Dead);
    }

    #[tokio::test]
    async fn test_refresh_handle_spawn_disabled() {
        let config = RefreshConfig {
            enabled: false,
            ..Default::default()
        };
        let svc = service("nobody", || WeatherError::upstream("unused"));

        let mut handle = RefreshHandle::spawn(config, svc, Arc::new(MemoryDeadLetterStore::new()));

        // With refresh disabled, there should be no messages
        assert!(try_recv(&mut handle).is_none());
        handle.shutdown().await;
    }
}
