// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the geoplane control plane.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Job store URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Path of the JSON process registry
    pub process_registry: PathBuf,
    /// Path of the JSON tenant policy file, if any
    pub tenant_policies: Option<PathBuf>,
    /// Added to a tier's target latency to form the synchronous deadline
    pub sync_guard_band: Duration,
    /// CPU-seconds accounting window for admission
    pub admission_window: Duration,
    /// Completion messages processed in parallel
    pub listener_concurrency: usize,
    /// Async worker poll interval
    pub worker_poll_interval: Duration,
    /// Jobs claimed per worker poll
    pub worker_batch_size: i64,
    /// Lease on a claimed async job before another worker may take it
    pub visibility_timeout: Duration,
    /// Slots of the in-process tier
    pub local_max_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("GEOPLANE_DATABASE_URL")?;
        let process_registry = PathBuf::from(required("GEOPLANE_PROCESS_REGISTRY")?);
        let tenant_policies = std::env::var("GEOPLANE_TENANT_POLICIES")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let sync_guard_band =
            Duration::from_millis(parse_or("GEOPLANE_SYNC_GUARD_BAND_MS", 2_000u64)?);
        let admission_window =
            Duration::from_secs(positive("GEOPLANE_ADMISSION_WINDOW_SECS", 60u64)?);
        let listener_concurrency = positive("GEOPLANE_LISTENER_CONCURRENCY", 8usize)?;
        let worker_poll_interval =
            Duration::from_millis(positive("GEOPLANE_WORKER_POLL_INTERVAL_MS", 1_000u64)?);
        let worker_batch_size = positive("GEOPLANE_WORKER_BATCH_SIZE", 10i64)?;
        let visibility_timeout =
            Duration::from_secs(positive("GEOPLANE_VISIBILITY_TIMEOUT_SECS", 300u64)?);
        let local_max_concurrency = positive("GEOPLANE_LOCAL_MAX_CONCURRENCY", 16usize)?;

        Ok(Self {
            database_url,
            process_registry,
            tenant_policies,
            sync_guard_band,
            admission_window,
            listener_concurrency,
            worker_poll_interval,
            worker_batch_size,
            visibility_timeout,
            local_max_concurrency,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(name, "must be greater than zero".to_string()));
    }
    Ok(value)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
