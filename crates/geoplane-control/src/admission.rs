// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control.
//!
//! Every job passes through [`AdmissionController::admit`] before any tier is
//! attempted. Admission resolves the tenant override, picks the resource
//! class and reserves capacity against per-tenant, per-class counters:
//!
//! | Counter | Released when | Limit |
//! |---------|---------------|-------|
//! | concurrency | job reaches a terminal status | `max_concurrency` |
//! | connections (database-bound classes) | job reaches a terminal status | `max_connections` |
//! | CPU-seconds | accounting window rolls over | `cpu_seconds_per_window` |
//!
//! Check and increment happen under one lock, so two requests that would
//! jointly exceed a limit are never both admitted. A reservation is keyed by
//! job id and released at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use geoplane_core::{QuotaLimits, ResourceClass};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::policy::{PolicyError, TenantPolicyOverride, TenantPolicySource};
use crate::registry::ProcessDefinition;

const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// A request for admission.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Id the job will be created under; keys the reservation.
    pub job_id: &'a str,
    /// Requesting tenant.
    pub tenant_id: &'a str,
    /// Process being requested.
    pub definition: &'a ProcessDefinition,
}

/// Capacity held by an admitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Job holding the reservation.
    pub job_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Class the job was admitted under.
    pub resource_class: ResourceClass,
    /// CPU-seconds charged to the current window.
    pub cpu_seconds: u64,
    /// Database connections held.
    pub connections: u32,
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Capacity reserved.
    Admitted {
        /// Reservation to release when the job finishes.
        reservation: Reservation,
        /// The tenant override resolved for this request.
        policy: Option<TenantPolicyOverride>,
    },
    /// Request refused.
    Rejected {
        /// Class the request would have run under.
        resource_class: ResourceClass,
        /// Which limit was hit.
        reason: String,
        /// When to retry; `None` if the request can never be admitted as is.
        retry_after: Option<Duration>,
    },
}

impl AdmissionDecision {
    /// Whether capacity was reserved.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Resource class assigned to the request.
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Self::Admitted { reservation, .. } => reservation.resource_class,
            Self::Rejected { resource_class, .. } => *resource_class,
        }
    }
}

/// Current counter values for one tenant and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Reservations currently held.
    pub active: u32,
    /// Database connections currently held.
    pub connections: u32,
    /// CPU-seconds charged in the current window.
    pub cpu_seconds: u64,
}

#[derive(Debug)]
struct Counters {
    usage: Usage,
    window_start: Instant,
}

#[derive(Debug, Default)]
struct AdmissionState {
    counters: HashMap<(String, ResourceClass), Counters>,
    reservations: HashMap<String, Reservation>,
}

/// Per-tenant quota gate.
pub struct AdmissionController {
    policies: Arc<dyn TenantPolicySource>,
    window: Duration,
    tenant_limits: HashMap<(String, ResourceClass), QuotaLimits>,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// Create a controller with a CPU-seconds accounting `window`.
    pub fn new(policies: Arc<dyn TenantPolicySource>, window: Duration) -> Self {
        Self {
            policies,
            window,
            tenant_limits: HashMap::new(),
            state: Mutex::new(AdmissionState::default()),
        }
    }

    /// Replace the class defaults for one tenant.
    pub fn with_tenant_limits(
        mut self,
        tenant_id: impl Into<String>,
        class: ResourceClass,
        limits: QuotaLimits,
    ) -> Self {
        self.tenant_limits.insert((tenant_id.into(), class), limits);
        self
    }

    /// Limits applied to `tenant_id` for `class`.
    pub fn limits_for(&self, tenant_id: &str, class: ResourceClass) -> QuotaLimits {
        self.tenant_limits
            .get(&(tenant_id.to_string(), class))
            .copied()
            .unwrap_or_else(|| class.default_limits())
    }

    /// Resolve the tenant override without reserving anything.
    pub async fn resolve_policy(
        &self,
        tenant_id: &str,
        process_id: &str,
    ) -> Result<Option<TenantPolicyOverride>, PolicyError> {
        self.policies.get_override(tenant_id, process_id).await
    }

    /// Resolve policy and try to reserve capacity for one job.
    pub async fn admit(
        &self,
        request: AdmissionRequest<'_>,
    ) -> Result<AdmissionDecision, PolicyError> {
        let definition = request.definition;
        let policy = self
            .policies
            .get_override(request.tenant_id, &definition.id)
            .await?;

        let resource_class = policy
            .as_ref()
            .and_then(|p| p.resource_class)
            .unwrap_or(definition.default_resource_class);
        let limits = self.limits_for(request.tenant_id, resource_class);
        let cpu_seconds = definition.estimated_cpu_seconds;

        if let Some(cap) = policy.as_ref().and_then(|p| p.cost_cap)
            && cpu_seconds > cap
        {
            return Ok(self.reject(
                request,
                resource_class,
                format!(
                    "estimated cost of {} units exceeds the tenant cost cap of {}",
                    cpu_seconds, cap
                ),
                None,
            ));
        }
        if cpu_seconds > limits.cpu_seconds_per_window {
            return Ok(self.reject(
                request,
                resource_class,
                format!(
                    "estimated {} CPU-seconds exceeds the {} CPU-second window for {}",
                    cpu_seconds, limits.cpu_seconds_per_window, resource_class
                ),
                None,
            ));
        }

        let connections = match limits.max_connections {
            Some(_) if resource_class.is_database_bound() => 1,
            _ => 0,
        };

        let mut state = self.state.lock().await;
        if state.reservations.contains_key(request.job_id) {
            return Ok(self.reject(
                request,
                resource_class,
                format!("job '{}' already holds a reservation", request.job_id),
                None,
            ));
        }

        let now = Instant::now();
        let counters = state
            .counters
            .entry((request.tenant_id.to_string(), resource_class))
            .or_insert_with(|| Counters {
                usage: Usage::default(),
                window_start: now,
            });

        let elapsed = now.saturating_duration_since(counters.window_start);
        if elapsed >= self.window {
            counters.usage.cpu_seconds = 0;
            counters.window_start = now;
        }
        let retry_after = self
            .window
            .saturating_sub(now.saturating_duration_since(counters.window_start))
            .max(MIN_RETRY_AFTER);

        let usage = counters.usage;
        let exceeded = if usage.active >= limits.max_concurrency {
            Some(format!(
                "concurrency limit of {} reached for {}",
                limits.max_concurrency, resource_class
            ))
        } else if let Some(max) = limits.max_connections
            && connections > 0
            && usage.connections + connections > max
        {
            Some(format!(
                "connection budget of {} exhausted for {}",
                max, resource_class
            ))
        } else if usage.cpu_seconds + cpu_seconds > limits.cpu_seconds_per_window {
            Some(format!(
                "CPU-second budget of {} per {}s window exhausted for {}",
                limits.cpu_seconds_per_window,
                self.window.as_secs(),
                resource_class
            ))
        } else {
            None
        };

        if let Some(reason) = exceeded {
            drop(state);
            return Ok(self.reject(request, resource_class, reason, Some(retry_after)));
        }

        counters.usage.active += 1;
        counters.usage.connections += connections;
        counters.usage.cpu_seconds += cpu_seconds;

        let reservation = Reservation {
            job_id: request.job_id.to_string(),
            tenant_id: request.tenant_id.to_string(),
            resource_class,
            cpu_seconds,
            connections,
        };
        state
            .reservations
            .insert(reservation.job_id.clone(), reservation.clone());

        info!(
            job_id = %request.job_id,
            tenant_id = %request.tenant_id,
            process_id = %definition.id,
            resource_class = %resource_class,
            "Admission granted"
        );

        Ok(AdmissionDecision::Admitted {
            reservation,
            policy,
        })
    }

    /// Release the reservation held by `job_id`.
    ///
    /// Returns false if the job holds no reservation (never admitted by this
    /// controller, or already released).
    pub async fn release(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(reservation) = state.reservations.remove(job_id) else {
            debug!(job_id = %job_id, "No reservation to release");
            return false;
        };

        let key = (reservation.tenant_id.clone(), reservation.resource_class);
        if let Some(counters) = state.counters.get_mut(&key) {
            counters.usage.active = counters.usage.active.saturating_sub(1);
            counters.usage.connections = counters
                .usage
                .connections
                .saturating_sub(reservation.connections);
        } else {
            warn!(job_id = %job_id, "Reservation had no counters to release");
        }

        info!(
            job_id = %job_id,
            tenant_id = %reservation.tenant_id,
            resource_class = %reservation.resource_class,
            "Reservation released"
        );
        true
    }

    /// Whether `job_id` currently holds a reservation.
    pub async fn holds_reservation(&self, job_id: &str) -> bool {
        self.state.lock().await.reservations.contains_key(job_id)
    }

    /// Number of reservations currently held across all tenants.
    pub async fn active_reservations(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    /// Current counters for one tenant and class.
    pub async fn usage(&self, tenant_id: &str, class: ResourceClass) -> Usage {
        self.state
            .lock()
            .await
            .counters
            .get(&(tenant_id.to_string(), class))
            .map(|c| c.usage)
            .unwrap_or_default()
    }

    fn reject(
        &self,
        request: AdmissionRequest<'_>,
        resource_class: ResourceClass,
        reason: String,
        retry_after: Option<Duration>,
    ) -> AdmissionDecision {
        warn!(
            job_id = %request.job_id,
            tenant_id = %request.tenant_id,
            process_id = %request.definition.id,
            resource_class = %resource_class,
            reason = %reason,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Admission rejected"
        );
        AdmissionDecision::Rejected {
            resource_class,
            reason,
            retry_after,
        }
    }
}
