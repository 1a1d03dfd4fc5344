//! Poolcast library
//!
//! Cached hourly weather for pool sites: a freshness policy over a local
//! cache, stale fallback when the provider rate-limits, and a dead letter
//! queue that retries failed refreshes.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod dead_letter;
pub mod error;
pub mod freshness;
pub mod refresh;
pub mod service;
