//! poolcast - cached pool-site weather
//!
//! Serves hourly readings for configured pool sites from a local cache,
//! refreshing from Open-Meteo when the cache goes stale. Failed refreshes are
//! queued as dead letters and retried in the background.

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use poolcast::cache::FileCacheStore;
use poolcast::cli::{Cli, Command};
use poolcast::config::AppConfig;
use poolcast::data::OpenMeteoGateway;
use poolcast::dead_letter::{DeadLetterStore, FileDeadLetterStore, RetryWorker, TickOutcome};
use poolcast::error::WeatherError;
use poolcast::refresh::{RefreshConfig, RefreshHandle, RefreshMessage, WeatherRefreshHandler, WEATHER_REFRESH_OPERATION};
use poolcast::service::WeatherService;

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("poolcast=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("poolcast=info"))
    };

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn build_service(config: &AppConfig) -> Result<Arc<WeatherService>, Box<dyn Error>> {
    let cache = match &config.cache.dir {
        Some(dir) => FileCacheStore::with_dir(dir.clone()),
        None => FileCacheStore::new().ok_or("Could not determine a cache directory; set cache.dir")?,
    };
    debug!(dir = %cache.cache_dir().display(), "using cache directory");

    let gateway = OpenMeteoGateway::new(Duration::from_secs(config.upstream.timeout_secs))?
        .with_base_url(config.upstream.base_url.clone())
        .with_default_retry_after(config.upstream.default_retry_after_secs);

    let service = WeatherService::new(config.location_directory(), Arc::new(cache), Arc::new(gateway))
        .with_ttl(config.cache_ttl())
        .with_window(config.upstream.past_hours, config.upstream.forecast_hours);

    Ok(Arc::new(service))
}

fn build_dead_letters(config: &AppConfig) -> Result<Arc<dyn DeadLetterStore>, Box<dyn Error>> {
    let store = match &config.retry.store_path {
        Some(path) => FileDeadLetterStore::with_path(path.clone()),
        None => FileDeadLetterStore::new().ok_or("Could not determine a data directory; set retry.store_path")?,
    };
    debug!(path = %store.path().display(), "using dead letter store");
    Ok(Arc::new(store))
}

fn build_worker(config: &AppConfig, service: Arc<WeatherService>, store: Arc<dyn DeadLetterStore>) -> RetryWorker {
    RetryWorker::builder(store, config.retry.worker_config())
        .handler(WEATHER_REFRESH_OPERATION, Arc::new(WeatherRefreshHandler::new(service)))
        .backoff(config.retry.backoff())
        .build()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes the error body to stderr and picks the exit code
fn report_failure(error: &WeatherError) -> Result<ExitCode, Box<dyn Error>> {
    warn!(status = error.status_code(), error = %error, "request failed");
    eprintln!("{}", serde_json::to_string(&error.to_body())?);
    Ok(ExitCode::FAILURE)
}

fn log_refresh_message(message: RefreshMessage) {
    match message {
        RefreshMessage::RefreshStarted => debug!("refresh sweep started"),
        RefreshMessage::ForecastUpdated {
            location_key,
            origin,
            readings,
        } => info!(location = %location_key, ?origin, readings, "forecast updated"),
        RefreshMessage::RefreshError { location_key, error } => {
            warn!(location = %location_key, error = %error, "refresh failed")
        }
        RefreshMessage::RefreshCompleted => debug!("refresh sweep completed"),
    }
}

async fn serve(config: &AppConfig, service: Arc<WeatherService>, store: Arc<dyn DeadLetterStore>) -> Result<(), Box<dyn Error>> {
    let worker = build_worker(config, Arc::clone(&service), Arc::clone(&store));
    worker.start();

    let refresh_config = RefreshConfig::from(&config.refresh);
    if !refresh_config.enabled {
        info!("background refresh disabled");
    }
    let mut refresh = RefreshHandle::spawn(refresh_config, service, store);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("serving; press Ctrl-C to stop");
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            Some(message) = refresh.receiver.recv() => log_refresh_message(message),
        }
    }

    info!("shutting down");
    refresh.shutdown().await;
    worker.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    debug!("poolcast starting with args: {:?}", cli);

    let config = AppConfig::load(cli.config.as_deref())?;
    let service = build_service(&config)?;

    match cli.command {
        Command::Forecast { location } => match service.get_data(&location, Utc::now()).await {
            Ok(forecast) => print_json(&forecast)?,
            Err(e) => return report_failure(&e),
        },
        Command::Refresh { location } => match service.refresh(&location, Utc::now()).await {
            Ok(forecast) => print_json(&forecast)?,
            Err(e) => return report_failure(&e),
        },
        Command::Locations => print_json(service.locations().all())?,
        Command::DeadLetters { status } => {
            let store = build_dead_letters(&config)?;
            let entries = match status {
                Some(status) => store.list_by_status(status).await?,
                None => store.list().await?,
            };
            print_json(&entries)?;
        }
        Command::Retry { once } => {
            let store = build_dead_letters(&config)?;
            let worker = build_worker(&config, service, store);
            if once {
                match worker.run_once(Utc::now()).await {
                    TickOutcome::Completed(report) => print_json(&report)?,
                    TickOutcome::Skipped => info!("tick skipped; another tick is in flight"),
                }
            } else {
                worker.start();
                tokio::signal::ctrl_c().await?;
                worker.stop().await;
            }
        }
        Command::Serve => {
            let store = build_dead_letters(&config)?;
            serve(&config, service, store).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
