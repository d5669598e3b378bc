// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geoplane - geoprocessing control plane
//!
//! Runs the async worker against the configured job store with the
//! in-process tier registered. Protocol adapters embed
//! [`ControlPlaneRuntime`] and call its control plane directly.

use std::sync::Arc;
use tracing::{info, warn};

use geoplane_control::config::Config;
use geoplane_control::executor::{ExecutorSet, LocalExecutor};
use geoplane_control::policy::StaticPolicySource;
use geoplane_control::registry::ProcessRegistry;
use geoplane_control::runtime::ControlPlaneRuntime;
use geoplane_core::{JobStore, PostgresJobStore, SqliteJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geoplane_control=info,geoplane_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        registry = %config.process_registry.display(),
        tenant_policies = ?config.tenant_policies,
        "Starting geoplane control plane"
    );

    let store = connect_store(&config.database_url).await?;
    info!("Job store connected and migrated");

    let registry = Arc::new(ProcessRegistry::from_path(&config.process_registry)?);
    info!(processes = registry.len(), "Process registry loaded");

    let policies = match &config.tenant_policies {
        Some(path) => StaticPolicySource::from_path(path)?,
        None => StaticPolicySource::empty(),
    };
    info!(overrides = policies.len(), "Tenant policies loaded");

    let executors =
        ExecutorSet::new().with(Arc::new(LocalExecutor::new(config.local_max_concurrency)));

    let runtime = ControlPlaneRuntime::builder()
        .store(store)
        .registry(registry)
        .policies(Arc::new(policies))
        .executors(executors)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!("Geoplane control plane ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Geoplane control plane shut down");

    Ok(())
}

async fn connect_store(url: &str) -> anyhow::Result<Arc<dyn JobStore>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresJobStore::connect(url, 10).await?))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteJobStore::connect(url, 5).await?))
    } else {
        Err(anyhow::anyhow!(
            "unsupported GEOPLANE_DATABASE_URL scheme, expected postgres:// or sqlite:"
        ))
    }
}
