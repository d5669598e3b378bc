// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for geoplane-control tests.
//!
//! Provides TestContext wiring a control plane over a file-backed SQLite
//! store, a fixed process catalog and mock tier executors.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use geoplane_control::ControlPlane;
use geoplane_control::admission::AdmissionController;
use geoplane_control::executor::ExecutorSet;
use geoplane_control::policy::{StaticPolicySource, TenantPolicyOverride, TenantPolicySource};
use geoplane_control::registry::ProcessRegistry;
use geoplane_core::{JobStore, QuotaLimits, ResourceClass, SqliteJobStore};

/// Process catalog used across the integration tests.
///
/// - `buffer` prefers the database but can run locally.
/// - `dissolve` runs only inside the database.
/// - `hotspot` runs only on the batch tier.
pub const PROCESSES: &str = r#"
[
  {
    "id": "buffer",
    "title": "Buffer features",
    "version": "1.0.0",
    "tiers": ["db_native", "fast_local"],
    "handlers": {"db_native": "geo.st_buffer", "fast_local": "buffer"},
    "parameters": {"required": ["distance"], "properties": {"distance": "number", "units": "string"}},
    "default_resource_class": "burst_cpu",
    "estimated_cpu_seconds": 2
  },
  {
    "id": "dissolve",
    "title": "Dissolve polygons",
    "version": "1.0.0",
    "tiers": ["db_native"],
    "handlers": {"db_native": "geo.st_union"},
    "default_resource_class": "db_heavy",
    "estimated_cpu_seconds": 5
  },
  {
    "id": "hotspot",
    "title": "Hotspot analysis",
    "version": "2.1.0",
    "tiers": ["cloud_batch"],
    "handlers": {"cloud_batch": "hotspot:2.1"},
    "default_resource_class": "long_tail",
    "estimated_cpu_seconds": 60,
    "job_control_options": ["async"]
  }
]
"#;

/// Dataset hosted in PostGIS.
pub const POSTGIS_DATASET: &str = "postgis://gis/public.parcels";

/// Dataset hosted in object storage.
pub const S3_DATASET: &str = "s3://tiles/parcels.parquet";

/// Control plane over a temporary SQLite database.
pub struct TestContext {
    pub plane: Arc<ControlPlane>,
    pub store: Arc<dyn JobStore>,
    pub admission: Arc<AdmissionController>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    /// Builder with no policies and class default limits.
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder::default()
    }

    /// Context with the given executors and defaults otherwise.
    pub async fn new(executors: ExecutorSet) -> Self {
        Self::builder().executors(executors).build().await
    }
}

/// Builder for [`TestContext`].
#[derive(Default)]
pub struct TestContextBuilder {
    executors: ExecutorSet,
    overrides: Vec<TenantPolicyOverride>,
    limits: Vec<(String, ResourceClass, QuotaLimits)>,
    guard_band: Option<Duration>,
}

impl TestContextBuilder {
    pub fn executors(mut self, executors: ExecutorSet) -> Self {
        self.executors = executors;
        self
    }

    pub fn policy(mut self, policy: TenantPolicyOverride) -> Self {
        self.overrides.push(policy);
        self
    }

    pub fn limits(mut self, tenant_id: &str, class: ResourceClass, limits: QuotaLimits) -> Self {
        self.limits.push((tenant_id.to_string(), class, limits));
        self
    }

    pub fn guard_band(mut self, guard_band: Duration) -> Self {
        self.guard_band = Some(guard_band);
        self
    }

    pub async fn build(self) -> TestContext {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteJobStore::from_path(dir.path().join("jobs.db"))
                .await
                .expect("Failed to open SQLite store"),
        );
        let registry = Arc::new(ProcessRegistry::from_json(PROCESSES).expect("Invalid test catalog"));

        let policies: Arc<dyn TenantPolicySource> = Arc::new(StaticPolicySource::new(self.overrides));
        let admission = self.limits.into_iter().fold(
            AdmissionController::new(policies, Duration::from_secs(60)),
            |admission, (tenant, class, limits)| admission.with_tenant_limits(tenant, class, limits),
        );
        let admission = Arc::new(admission);

        let plane = ControlPlane::new(store.clone(), registry, admission.clone(), self.executors)
            .with_guard_band(self.guard_band.unwrap_or(Duration::from_millis(100)));

        TestContext {
            plane: Arc::new(plane),
            store,
            admission,
            _dir: dir,
        }
    }
}

/// Limits with the given concurrency and generous everything else.
pub fn concurrency_limits(max_concurrency: u32) -> QuotaLimits {
    QuotaLimits {
        max_concurrency,
        max_duration: Duration::from_secs(60),
        max_connections: None,
        cpu_seconds_per_window: 1_000_000,
    }
}

/// Override for `tenant_id` on `process_id` with nothing set.
pub fn override_for(tenant_id: &str, process_id: &str) -> TenantPolicyOverride {
    TenantPolicyOverride {
        tenant_id: tenant_id.to_string(),
        process_id: process_id.to_string(),
        forced_tiers: None,
        resource_class: None,
        cost_cap: None,
    }
}

/// Poll until the job reaches `status`, failing the test after five seconds.
pub async fn wait_for_status(
    store: &Arc<dyn JobStore>,
    job_id: &str,
    status: geoplane_core::JobStatus,
) -> geoplane_core::Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = store.get_required(job_id).await.expect("job lookup failed");
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {} never reached {}", job_id, status))
}
