// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the geoplane control plane.
//!
//! [`ControlPlaneRuntime`] wires a [`ControlPlane`] and starts its background
//! tasks (the async worker and, when a completion source is configured, the
//! completion listener) inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use geoplane_control::executor::{ExecutorSet, LocalExecutor};
//! use geoplane_control::registry::ProcessRegistry;
//! use geoplane_control::runtime::ControlPlaneRuntime;
//! use geoplane_core::SqliteJobStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteJobStore::connect("sqlite:jobs.db", 5).await?);
//!     let registry = Arc::new(ProcessRegistry::from_path("processes.json")?);
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .store(store)
//!         .registry(registry)
//!         .executors(ExecutorSet::new().with(Arc::new(LocalExecutor::new(16))))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand runtime.control_plane() to your protocol adapter ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use geoplane_core::{JobStore, QuotaLimits, ResourceClass};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::coordinator::DEFAULT_GUARD_BAND;
use crate::datasource::{DataSourceResolver, SchemeResolver};
use crate::executor::ExecutorSet;
use crate::listener::{CompletionListener, CompletionSource, DeadLetterSink, MemoryDeadLetterSink};
use crate::policy::{StaticPolicySource, TenantPolicySource};
use crate::registry::ProcessRegistry;
use crate::selector::{DeterministicSelector, TierSelector};
use crate::worker::{AsyncWorker, AsyncWorkerConfig};

/// Builder for creating a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeBuilder {
    store: Option<Arc<dyn JobStore>>,
    registry: Option<Arc<ProcessRegistry>>,
    policies: Arc<dyn TenantPolicySource>,
    executors: ExecutorSet,
    resolver: Arc<dyn DataSourceResolver>,
    selector: Arc<dyn TierSelector>,
    completion_source: Option<Arc<dyn CompletionSource>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    tenant_limits: HashMap<(String, ResourceClass), QuotaLimits>,
    guard_band: Duration,
    admission_window: Duration,
    listener_concurrency: usize,
    worker: AsyncWorkerConfig,
}

impl Default for ControlPlaneRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            policies: Arc::new(StaticPolicySource::empty()),
            executors: ExecutorSet::new(),
            resolver: Arc::new(SchemeResolver),
            selector: Arc::new(DeterministicSelector),
            completion_source: None,
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            tenant_limits: HashMap::new(),
            guard_band: DEFAULT_GUARD_BAND,
            admission_window: Duration::from_secs(60),
            listener_concurrency: 8,
            worker: AsyncWorkerConfig::default(),
        }
    }
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job store (required).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the process registry (required).
    pub fn registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the tenant policy source.
    ///
    /// Default: no overrides
    pub fn policies(mut self, policies: Arc<dyn TenantPolicySource>) -> Self {
        self.policies = policies;
        self
    }

    /// Set the tier executors (at least one required).
    pub fn executors(mut self, executors: ExecutorSet) -> Self {
        self.executors = executors;
        self
    }

    /// Set the data-source resolver.
    ///
    /// Default: [`SchemeResolver`]
    pub fn resolver(mut self, resolver: Arc<dyn DataSourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the tier selection strategy.
    ///
    /// Default: [`DeterministicSelector`]
    pub fn selector(mut self, selector: Arc<dyn TierSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Set the completion channel. Without one no listener is started.
    pub fn completion_source(mut self, source: Arc<dyn CompletionSource>) -> Self {
        self.completion_source = Some(source);
        self
    }

    /// Set where unusable completion messages go.
    ///
    /// Default: in-memory sink
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Replace the class defaults for one tenant.
    pub fn tenant_limits(
        mut self,
        tenant_id: impl Into<String>,
        class: ResourceClass,
        limits: QuotaLimits,
    ) -> Self {
        self.tenant_limits.insert((tenant_id.into(), class), limits);
        self
    }

    /// Set the synchronous guard band.
    ///
    /// Default: 2 seconds
    pub fn guard_band(mut self, guard_band: Duration) -> Self {
        self.guard_band = guard_band;
        self
    }

    /// Set the CPU-seconds accounting window.
    ///
    /// Default: 60 seconds
    pub fn admission_window(mut self, window: Duration) -> Self {
        self.admission_window = window;
        self
    }

    /// Set how many completion messages are processed at once.
    ///
    /// Default: 8
    pub fn listener_concurrency(mut self, concurrency: usize) -> Self {
        self.listener_concurrency = concurrency;
        self
    }

    /// Set the async worker configuration.
    pub fn worker(mut self, config: AsyncWorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Apply the tunables of a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.guard_band = config.sync_guard_band;
        self.admission_window = config.admission_window;
        self.listener_concurrency = config.listener_concurrency;
        self.worker = AsyncWorkerConfig {
            poll_interval: config.worker_poll_interval,
            batch_size: config.worker_batch_size,
            visibility_timeout: config.visibility_timeout,
        };
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        if self.executors.is_empty() {
            return Err(anyhow::anyhow!("at least one executor is required"));
        }

        let admission = self.tenant_limits.into_iter().fold(
            AdmissionController::new(self.policies, self.admission_window),
            |admission, ((tenant_id, class), limits)| {
                admission.with_tenant_limits(tenant_id, class, limits)
            },
        );

        let plane = ControlPlane::new(store, registry, Arc::new(admission), self.executors)
            .with_guard_band(self.guard_band)
            .with_resolver(self.resolver)
            .with_selector(self.selector);

        Ok(ControlPlaneRuntimeConfig {
            plane: Arc::new(plane),
            completion_source: self.completion_source,
            dead_letters: self.dead_letters,
            listener_concurrency: self.listener_concurrency,
            worker: self.worker,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    plane: Arc<ControlPlane>,
    completion_source: Option<Arc<dyn CompletionSource>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    listener_concurrency: usize,
    worker: AsyncWorkerConfig,
}

impl ControlPlaneRuntimeConfig {
    /// Start the runtime, spawning the async worker and completion listener tasks.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        if !self.plane.store().health_check().await? {
            return Err(anyhow::anyhow!("job store failed its health check"));
        }

        let worker = AsyncWorker::new(self.plane.clone(), self.worker);
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        let listener = self.completion_source.map(|source| {
            let listener = CompletionListener::new(
                source,
                self.dead_letters.clone(),
                self.plane.store().clone(),
                self.plane.admission().clone(),
                self.listener_concurrency,
            );
            let shutdown = listener.shutdown_handle();
            let handle = tokio::spawn(async move {
                listener.run().await;
            });
            (handle, shutdown)
        });

        info!(
            executors = ?self.plane.coordinator().executors().tiers(),
            processes = self.plane.list_processes().len(),
            listener = listener.is_some(),
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            plane: self.plane,
            worker_handle,
            worker_shutdown,
            listener,
        })
    }
}

/// A running control plane that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    plane: Arc<ControlPlane>,
    worker_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    listener: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// The control plane facade.
    pub fn control_plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the async worker and the completion listener to stop, then
    /// waits for them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControlPlaneRuntime shutting down...");

        self.worker_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.listener {
            shutdown.notify_one();
        }

        if let Err(e) = self.worker_handle.await {
            error!("Async worker task panicked: {}", e);
        }
        if let Some((handle, _)) = self.listener
            && let Err(e) = handle.await
        {
            error!("Completion listener task panicked: {}", e);
        }

        info!("ControlPlaneRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        let listener_running = self
            .listener
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());
        !self.worker_handle.is_finished() && listener_running
    }
}
