//! Command-line interface parsing for poolcast
//!
//! Each subcommand maps onto one operation of the weather service or the
//! dead letter queue. Global flags select the config file and log level.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::dead_letter::DeadLetterStatus;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The specified dead letter status is not recognized
    #[error("{0}")]
    InvalidStatus(String),
}

/// Cached pool-site weather with rate-limit fallback and dead letter retries
#[derive(Parser, Debug)]
#[command(name = "poolcast")]
#[command(about = "Cached pool-site weather with rate-limit fallback and dead letter retries")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file (defaults to $POOLCAST_CONFIG, then the XDG config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print readings for a location, refreshing from the provider when stale
    Forecast {
        /// Location id from the config
        location: String,
    },

    /// Refresh a location from the provider regardless of cache age
    Refresh {
        /// Location id from the config
        location: String,
    },

    /// Retry due dead letters
    ///
    /// Without --once the worker keeps ticking until Ctrl-C.
    Retry {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// List dead letters
    DeadLetters {
        /// Only show entries with this status (pending, resolved, dead)
        #[arg(long, value_parser = parse_status_arg)]
        status: Option<DeadLetterStatus>,
    },

    /// Run the background refresh sweep and the retry worker until Ctrl-C
    Serve,

    /// List configured locations
    Locations,
}

/// Parses a `--status` value
pub fn parse_status_arg(s: &str) -> Result<DeadLetterStatus, CliError> {
    s.parse().map_err(CliError::InvalidStatus)
}
