//! Periodic retry worker
//!
//! The worker's lifecycle is an explicit state machine:
//!
//! ```text
//!            start                 tick begins
//! Stopped ---------> Scheduled ------------------> Ticking { scheduled: true }
//!    ^  \               |  ^          tick ends          |
//!    |   \ run_once     |  +-----------------------------+
//!    |    \        stop |                                | stop
//!    |     v            v                                v
//!    +-- Ticking { scheduled: false } <-----------------+
//!            tick ends -> Stopped
//! ```
//!
//! A tick requested while another is in flight is skipped and logged.
//! `stop` prevents further ticks and waits for the in-flight one to finish.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{Backoff, DeadLetter, DeadLetterStatus, DeadLetterStore, FixedBackoff};

/// Error type returned by retry handlers
pub type RetryError = Box<dyn std::error::Error + Send + Sync>;

/// Returned by a handler when retrying can never succeed
///
/// The entry is marked dead immediately instead of using up its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure(pub String);

impl fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permanent failure: {}", self.0)
    }
}

impl std::error::Error for PermanentFailure {}

/// Re-runs the original operation behind a dead letter
#[async_trait]
pub trait RetryHandler: Send + Sync {
    /// `now` is the time of the tick driving this retry
    async fn retry(&self, entry: &DeadLetter, now: DateTime<Utc>) -> Result<(), RetryError>;
}

/// Tick cadence and retry limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Time between scheduled ticks
    pub tick_interval: Duration,
    /// Maximum entries retried per tick
    pub batch_size: usize,
    /// Failed retries before an entry goes dead
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            batch_size: 25,
            max_attempts: 5,
        }
    }
}

/// Lifecycle state of a [`RetryWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No timer; ticks only run through `run_once`
    Stopped,
    /// Timer armed, no tick in flight
    Scheduled,
    /// A tick is in flight; `scheduled` is the state to return to
    Ticking { scheduled: bool },
}

impl WorkerState {
    /// Transition for `start`; `None` if already scheduled
    pub fn start(self) -> Option<Self> {
        match self {
            WorkerState::Stopped => Some(WorkerState::Scheduled),
            WorkerState::Ticking { scheduled: false } => Some(WorkerState::Ticking { scheduled: true }),
            WorkerState::Scheduled | WorkerState::Ticking { scheduled: true } => None,
        }
    }

    /// Transition for `stop`; an in-flight tick keeps running
    pub fn stop(self) -> Self {
        match self {
            WorkerState::Ticking { .. } => WorkerState::Ticking { scheduled: false },
            _ => WorkerState::Stopped,
        }
    }

    /// Transition when a tick begins; `None` if one is already in flight
    pub fn begin_tick(self) -> Option<Self> {
        match self {
            WorkerState::Stopped => Some(WorkerState::Ticking { scheduled: false }),
            WorkerState::Scheduled => Some(WorkerState::Ticking { scheduled: true }),
            WorkerState::Ticking { .. } => None,
        }
    }

    /// Transition when a tick finishes
    pub fn end_tick(self) -> Self {
        match self {
            WorkerState::Ticking { scheduled: true } => WorkerState::Scheduled,
            WorkerState::Ticking { scheduled: false } => WorkerState::Stopped,
            other => other,
        }
    }

    pub fn is_ticking(self) -> bool {
        matches!(self, WorkerState::Ticking { .. })
    }
}

/// Counts from one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub attempted: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub dead: usize,
    /// Entries whose new state could not be saved
    pub store_errors: usize,
}

/// Result of asking the worker to tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still in flight
    Skipped,
    Completed(TickReport),
}

/// Builds a [`RetryWorker`] with its handlers and backoff
pub struct RetryWorkerBuilder {
    store: Arc<dyn DeadLetterStore>,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn RetryHandler>>,
    backoff: Option<Arc<dyn Backoff>>,
}

impl RetryWorkerBuilder {
    /// Registers the handler for entries tagged `operation`
    pub fn handler(mut self, operation: impl Into<String>, handler: Arc<dyn RetryHandler>) -> Self {
        self.handlers.insert(operation.into(), handler);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Defaults to a fixed backoff equal to the tick interval
    pub fn build(self) -> RetryWorker {
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(FixedBackoff(self.config.tick_interval)));
        RetryWorker {
            inner: Arc::new(Inner {
                store: self.store,
                config: self.config,
                handlers: self.handlers,
                backoff,
                state: Mutex::new(WorkerState::Stopped),
                timer: Mutex::new(None),
            }),
        }
    }
}

/// Retries due dead letters in bounded batches
#[derive(Clone)]
pub struct RetryWorker {
    inner: Arc<Inner>,
}

struct Timer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn DeadLetterStore>,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn RetryHandler>>,
    backoff: Arc<dyn Backoff>,
    state: Mutex<WorkerState>,
    timer: Mutex<Option<Timer>>,
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ends the tick when dropped, so a cancelled tick never wedges the worker
struct TickGuard<'a>(&'a Mutex<WorkerState>);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.0);
        *state = state.end_tick();
    }
}

impl RetryWorker {
    pub fn builder(store: Arc<dyn DeadLetterStore>, config: WorkerConfig) -> RetryWorkerBuilder {
        RetryWorkerBuilder {
            store,
            config,
            handlers: HashMap::new(),
            backoff: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.inner.state)
    }

    pub fn config(&self) -> WorkerConfig {
        self.inner.config
    }

    /// Runs a single tick now, unless one is already in flight
    pub async fn run_once(&self, now: DateTime<Utc>) -> TickOutcome {
        self.inner.run_once(now).await
    }

    /// Arms the interval timer; does nothing if already scheduled
    ///
    /// Must be called from within a tokio runtime. The first tick fires one
    /// interval after starting.
    pub fn start(&self) {
        {
            let mut state = lock(&self.inner.state);
            match state.start() {
                Some(next) => *state = next,
                None => {
                    debug!("retry worker already scheduled");
                    return;
                }
            }
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first tick (immediate)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.run_once(Utc::now()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "retry worker started");
        *lock(&self.inner.timer) = Some(Timer { shutdown_tx, handle });
    }

    /// Stops scheduling ticks and waits for an in-flight tick to complete
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            *state = state.stop();
        }

        let timer = lock(&self.inner.timer).take();
        if let Some(timer) = timer {
            let _ = timer.shutdown_tx.send(true);
            if let Err(e) = timer.handle.await {
                error!(error = %e, "retry worker task ended abnormally");
            }
            info!("retry worker stopped");
        }
    }
}

impl Inner {
    async fn run_once(&self, now: DateTime<Utc>) -> TickOutcome {
        {
            let mut state = lock(&self.state);
            match state.begin_tick() {
                Some(next) => *state = next,
                None => {
                    info!("previous retry tick still running, skipping");
                    return TickOutcome::Skipped;
                }
            }
        }
        let _tick = TickGuard(&self.state);

        let report = self.process_batch(now).await;
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                resolved = report.resolved,
                rescheduled = report.rescheduled,
                dead = report.dead,
                "retry tick finished"
            );
        }
        TickOutcome::Completed(report)
    }

    async fn process_batch(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let batch = match self.store.due(now, self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to load due dead letters");
                return report;
            }
        };

        for mut entry in batch {
            report.attempted += 1;

            match self.attempt(&entry, now).await {
                Ok(()) => {
                    entry.resolve(now);
                    report.resolved += 1;
                    info!(id = %entry.id, operation = %entry.operation, key = %entry.key, attempts = entry.attempts, "dead letter resolved");
                }
                Err(e) if e.downcast_ref::<PermanentFailure>().is_some() => {
                    entry.mark_dead(e.to_string(), now);
                    report.dead += 1;
                    error!(id = %entry.id, operation = %entry.operation, key = %entry.key, error = %e, "dead letter abandoned");
                }
                Err(e) => {
                    let delay = self.backoff.next_delay(entry.attempts + 1);
                    let status = entry.record_failure(e.to_string(), now, self.config.max_attempts, delay);
                    if status == DeadLetterStatus::Dead {
                        report.dead += 1;
                        error!(
                            id = %entry.id,
                            operation = %entry.operation,
                            key = %entry.key,
                            attempts = entry.attempts,
                            error = %e,
                            "dead letter exhausted its attempts"
                        );
                    } else {
                        report.rescheduled += 1;
                        warn!(
                            id = %entry.id,
                            operation = %entry.operation,
                            key = %entry.key,
                            attempts = entry.attempts,
                            next_attempt_at = %entry.next_attempt_at,
                            error = %e,
                            "retry failed, rescheduled"
                        );
                    }
                }
            }

            if let Err(e) = self.store.save(&entry).await {
                report.store_errors += 1;
                error!(id = %entry.id, error = %e, "failed to save dead letter");
            }
        }

        report
    }

    /// Runs the handler for one entry, turning a panic into a failed attempt
    async fn attempt(&self, entry: &DeadLetter, now: DateTime<Utc>) -> Result<(), RetryError> {
        let Some(handler) = self.handlers.get(&entry.operation) else {
            return Err(format!("no handler registered for operation '{}'", entry.operation).into());
        };

        match AssertUnwindSafe(handler.retry(entry, now)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err("retry handler panicked".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::MemoryDeadLetterStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Fails the first `failures` calls, then succeeds
    struct FlakyHandler {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyHandler {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RetryHandler for FlakyHandler {
        async fn retry(&self, _entry: &DeadLetter, _now: DateTime<Utc>) -> Result<(), RetryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(format!("failure {}", n + 1).into())
            } else {
                Ok(())
            }
        }
    }

    /// Blocks inside the handler until released
    struct GateHandler {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RetryHandler for GateHandler {
        async fn retry(&self, _entry: &DeadLetter, _now: DateTime<Utc>) -> Result<(), RetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl RetryHandler for PanicHandler {
        async fn retry(&self, _entry: &DeadLetter, _now: DateTime<Utc>) -> Result<(), RetryError> {
            panic!("handler bug");
        }
    }

    struct PermanentHandler;

    #[async_trait]
    impl RetryHandler for PermanentHandler {
        async fn retry(&self, entry: &DeadLetter, _now: DateTime<Utc>) -> Result<(), RetryError> {
            Err(Box::new(PermanentFailure(format!("{} no longer exists", entry.key))))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    fn config(max_attempts: u32) -> WorkerConfig {
        WorkerConfig {
            tick_interval: Duration::from_secs(60),
            batch_size: 10,
            max_attempts,
        }
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            TickOutcome::Skipped => panic!("tick was unexpectedly skipped"),
        }
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(WorkerState::Stopped.start(), Some(WorkerState::Scheduled));
        assert_eq!(WorkerState::Scheduled.start(), None);
        assert_eq!(WorkerState::Scheduled.begin_tick(), Some(WorkerState::Ticking { scheduled: true }));
        assert_eq!(WorkerState::Stopped.begin_tick(), Some(WorkerState::Ticking { scheduled: false }));
        assert_eq!(WorkerState::Ticking { scheduled: true }.begin_tick(), None);
        assert_eq!(WorkerState::Ticking { scheduled: true }.end_tick(), WorkerState::Scheduled);
        assert_eq!(WorkerState::Ticking { scheduled: false }.end_tick(), WorkerState::Stopped);
        assert_eq!(WorkerState::Ticking { scheduled: true }.stop(), WorkerState::Ticking { scheduled: false });
        assert_eq!(WorkerState::Scheduled.stop(), WorkerState::Stopped);
        assert_eq!(
            WorkerState::Ticking { scheduled: false }.start(),
            Some(WorkerState::Ticking { scheduled: true })
        );
    }

    #[tokio::test]
    async fn test_entry_goes_dead_after_max_attempts_and_is_excluded() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let entry = DeadLetter::new("weather_refresh", "kits-pool", t0());
        let id = entry.id;
        store.enqueue(entry).await.unwrap();
        let handler = FlakyHandler::new(usize::MAX);
        let worker = RetryWorker::builder(store.clone(), config(3))
            .handler("weather_refresh", handler.clone())
            .build();

        let mut now = t0();
        for _ in 0..3 {
            completed(worker.run_once(now).await);
            now += chrono::Duration::seconds(60);
        }

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeadLetterStatus::Dead);
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error.as_deref(), Some("failure 3"));

        let report = completed(worker.run_once(now + chrono::Duration::days(1)).await);
        assert_eq!(report.attempted, 0);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn test_entry_resolves_on_success_and_is_excluded() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let entry = DeadLetter::new("weather_refresh", "kits-pool", t0());
        let id = entry.id;
        store.enqueue(entry).await.unwrap();
        let handler = FlakyHandler::new(1);
        let worker = RetryWorker::builder(store.clone(), config(5))
            .handler("weather_refresh", handler.clone())
            .build();

        let first = completed(worker.run_once(t0()).await);
        assert_eq!(first.rescheduled, 1);

        // Not due again until the fixed backoff (one tick interval) has passed
        let early = completed(worker.run_once(t0() + chrono::Duration::seconds(30)).await);
        assert_eq!(early.attempted, 0);

        let second = completed(worker.run_once(t0() + chrono::Duration::seconds(60)).await);
        assert_eq!(second.resolved, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, DeadLetterStatus::Resolved);

        let after = completed(worker.run_once(t0() + chrono::Duration::days(1)).await);
        assert_eq!(after.attempted, 0);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_each_tick() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        for i in 0..5 {
            store
                .enqueue(DeadLetter::new("weather_refresh", format!("pool-{}", i), t0()))
                .await
                .unwrap();
        }
        let worker = RetryWorker::builder(
            store.clone(),
            WorkerConfig {
                batch_size: 2,
                ..config(5)
            },
        )
        .handler("weather_refresh", FlakyHandler::new(0))
        .build();

        let report = completed(worker.run_once(t0()).await);

        assert_eq!(report.attempted, 2);
        assert_eq!(store.list_by_status(DeadLetterStatus::Pending).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failing_entry_does_not_halt_batch() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        store.enqueue(DeadLetter::new("unknown_op", "a", t0())).await.unwrap();
        store
            .enqueue(DeadLetter::new("panics", "b", t0() + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        store
            .enqueue(DeadLetter::new("weather_refresh", "c", t0() + chrono::Duration::seconds(2)))
            .await
            .unwrap();
        let worker = RetryWorker::builder(store.clone(), config(5))
            .handler("weather_refresh", FlakyHandler::new(0))
            .handler("panics", Arc::new(PanicHandler))
            .build();

        let report = completed(worker.run_once(t0() + chrono::Duration::seconds(5)).await);

        assert_eq!(report.attempted, 3);
        assert_eq!(report.rescheduled, 2);
        assert_eq!(report.resolved, 1);
        let pending = store.list_by_status(DeadLetterStatus::Pending).await.unwrap();
        assert!(pending
            .iter()
            .any(|e| e.last_error.as_deref() == Some("no handler registered for operation 'unknown_op'")));
        assert!(pending
            .iter()
            .any(|e| e.last_error.as_deref() == Some("retry handler panicked")));
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_dead_immediately() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let entry = DeadLetter::new("weather_refresh", "closed-pool", t0());
        let id = entry.id;
        store.enqueue(entry).await.unwrap();
        let worker = RetryWorker::builder(store.clone(), config(5))
            .handler("weather_refresh", Arc::new(PermanentHandler))
            .build();

        let report = completed(worker.run_once(t0()).await);

        assert_eq!(report.dead, 1);
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeadLetterStatus::Dead);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_once_is_skipped() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        store.enqueue(DeadLetter::new("weather_refresh", "kits-pool", t0())).await.unwrap();
        let handler = Arc::new(GateHandler {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let worker = RetryWorker::builder(store, config(5))
            .handler("weather_refresh", handler.clone())
            .build();

        let background = worker.clone();
        let first = tokio::spawn(async move { background.run_once(t0()).await });
        handler.entered.notified().await;

        assert!(worker.state().is_ticking());
        assert_eq!(worker.run_once(t0()).await, TickOutcome::Skipped);

        handler.release.notify_one();
        let report = completed(first.await.unwrap());
        assert_eq!(report.resolved, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_ticks_until_stopped() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let handler = FlakyHandler::new(0);
        let worker = RetryWorker::builder(
            store.clone(),
            WorkerConfig {
                tick_interval: Duration::from_millis(20),
                ..config(5)
            },
        )
        .handler("weather_refresh", handler.clone())
        .build();

        worker.start();
        worker.start(); // second start is a no-op
        assert_eq!(worker.state(), WorkerState::Scheduled);

        store.enqueue(DeadLetter::new("weather_refresh", "kits-pool", Utc::now())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        worker.stop().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(handler.calls(), 1);

        store.enqueue(DeadLetter::new("weather_refresh", "trout-lake", Utc::now())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.calls(), 1, "no ticks after stop");
    }
}
