// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The control plane facade.
//!
//! [`ControlPlane`] is the surface protocol adapters call. It wires admission,
//! selection, coordination and the job store into the request path:
//!
//! ```text
//! submit ─▶ registry ─▶ admission ─▶ selector ─▶ store.create ─┬─▶ coordinator (sync)
//!                                                              └─▶ queued (async)
//! ```
//!
//! Selection runs before the job is created, so a request without a
//! compatible tier leaves no record behind and never touches an executor.

use std::sync::Arc;
use std::time::Duration;

use geoplane_core::{
    AttemptOutcome, CancelOutcome, ExecutionMode, Job, JobFilter, JobPage, JobStatus, JobStore,
    NewJob, Pagination, StatusPayload, Transition,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionRequest};
use crate::coordinator::{CoordinatorOutcome, ExecutionCoordinator};
use crate::datasource::{DataSourceResolver, SchemeResolver};
use crate::error::{Error, Result};
use crate::executor::ExecutorSet;
use crate::listener::{CompletionError, CompletionMessage, Reconciled, reconcile};
use crate::registry::{ProcessDefinition, ProcessRegistry};
use crate::selector::{DeterministicSelector, TierSelector};

/// Largest page `query_jobs` will return.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// A request to execute a process.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Requesting tenant.
    pub tenant_id: String,
    /// Process to execute.
    pub process_id: String,
    /// Process parameters.
    pub parameters: Value,
    /// Referenced dataset, if the input is not inline.
    pub dataset_ref: Option<String>,
    /// Sync or async execution.
    pub mode: ExecutionMode,
    /// Trace correlation id; generated when absent.
    pub trace_id: Option<String>,
}

impl SubmitRequest {
    /// Request with inline data and a generated trace id.
    pub fn new(
        tenant_id: impl Into<String>,
        process_id: impl Into<String>,
        parameters: Value,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            process_id: process_id.into(),
            parameters,
            dataset_ref: None,
            mode,
            trace_id: None,
        }
    }

    /// Reference a hosted dataset.
    pub fn with_dataset(mut self, dataset_ref: impl Into<String>) -> Self {
        self.dataset_ref = Some(dataset_ref.into());
        self
    }

    /// Set the trace correlation id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// What `submit` hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The job finished inline with a result.
    Completed(Job),
    /// The job is queued, degraded to async, or awaiting an external
    /// completion. Poll `get_job_status`.
    Accepted(Job),
}

impl SubmitOutcome {
    /// The job record.
    pub fn job(&self) -> &Job {
        match self {
            Self::Completed(job) | Self::Accepted(job) => job,
        }
    }
}

/// Entry point for protocol adapters.
pub struct ControlPlane {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessRegistry>,
    admission: Arc<AdmissionController>,
    resolver: Arc<dyn DataSourceResolver>,
    selector: Arc<dyn TierSelector>,
    coordinator: ExecutionCoordinator,
}

impl ControlPlane {
    /// Wire a control plane with the scheme resolver and the deterministic selector.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ProcessRegistry>,
        admission: Arc<AdmissionController>,
        executors: ExecutorSet,
    ) -> Self {
        let coordinator = ExecutionCoordinator::new(store.clone(), executors, admission.clone());
        Self {
            store,
            registry,
            admission,
            resolver: Arc::new(SchemeResolver),
            selector: Arc::new(DeterministicSelector),
            coordinator,
        }
    }

    /// Set the synchronous guard band.
    pub fn with_guard_band(mut self, guard_band: Duration) -> Self {
        self.coordinator = self.coordinator.with_guard_band(guard_band);
        self
    }

    /// Replace the data-source resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn DataSourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the tier selection strategy.
    pub fn with_selector(mut self, selector: Arc<dyn TierSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// The job store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The admission controller.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// The execution coordinator.
    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Admit a request and either execute it inline or enqueue it.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let definition = self.registry.get(&request.process_id)?;

        if !definition.allows_mode(request.mode) {
            return Err(Error::InvalidParameters(format!(
                "process '{}' does not support {} execution",
                definition.id, request.mode
            )));
        }
        definition
            .parameters
            .validate(&request.parameters)
            .map_err(Error::InvalidParameters)?;

        let job_id = NewJob::generate_id();
        let decision = self
            .admission
            .admit(AdmissionRequest {
                job_id: &job_id,
                tenant_id: &request.tenant_id,
                definition: &definition,
            })
            .await?;

        let (reservation, policy) = match decision {
            AdmissionDecision::Admitted {
                reservation,
                policy,
            } => (reservation, policy),
            AdmissionDecision::Rejected {
                reason,
                retry_after,
                ..
            } => return Err(Error::AdmissionRejected { reason, retry_after }),
        };

        let provider = self.resolver.resolve(request.dataset_ref.as_deref()).await;
        let selection = self.selector.select(&definition, policy.as_ref(), provider);
        let candidates = match selection.into_candidates(&definition.id) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.admission.release(&job_id).await;
                return Err(e);
            }
        };

        let new_job = NewJob {
            job_id: job_id.clone(),
            process_id: definition.id.clone(),
            tenant_id: request.tenant_id,
            parameters: request.parameters,
            dataset_ref: request.dataset_ref,
            resource_class: reservation.resource_class,
            mode: request.mode,
            trace_id: request
                .trace_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };
        let job = match self.store.create(&new_job).await {
            Ok(job) => job,
            Err(e) => {
                self.admission.release(&job_id).await;
                return Err(e.into());
            }
        };

        info!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            process_id = %job.process_id,
            mode = %job.mode,
            candidates = ?candidates,
            "Job created"
        );

        match job.mode {
            ExecutionMode::Async => Ok(SubmitOutcome::Accepted(job)),
            ExecutionMode::Sync => {
                match self
                    .coordinator
                    .run(&job, &definition, &candidates, policy.as_ref())
                    .await
                {
                    Ok(outcome) => self.settle(&job.job_id, outcome).await,
                    Err(e) => {
                        self.recover_sync_run(&job).await;
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// `submit` with the mode forced to sync.
    pub async fn execute_inline(&self, mut request: SubmitRequest) -> Result<SubmitOutcome> {
        request.mode = ExecutionMode::Sync;
        self.submit(request).await
    }

    /// `submit` with the mode forced to async.
    pub async fn enqueue_async(&self, mut request: SubmitRequest) -> Result<Job> {
        request.mode = ExecutionMode::Async;
        Ok(self.submit(request).await?.job().clone())
    }

    /// Current record of a job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Job> {
        Ok(self.store.get_required(job_id).await?)
    }

    /// Cancel a `queued` or `running` job.
    ///
    /// Releases the reservation and signals any in-flight tier call. The tier
    /// may still finish; its result is then dropped by the store.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(job_id).await?;
        match &outcome {
            CancelOutcome::Cancelled { previous, .. } => {
                info!(job_id = %job_id, previous = %previous, "Job cancelled");
                self.admission.release(job_id).await;
                self.coordinator.signal_cancel(job_id).await;
            }
            CancelOutcome::AlreadyTerminal(status) => {
                info!(job_id = %job_id, status = %status, "Cancel ignored, job already terminal");
            }
        }
        Ok(outcome)
    }

    /// Record a successful external completion.
    ///
    /// Idempotent: a job that is already terminal is returned unchanged.
    pub async fn record_completion(
        &self,
        job_id: &str,
        result_ref: Option<String>,
        outputs: Option<Value>,
        cost_units: Option<u64>,
    ) -> Result<Job> {
        let message = CompletionMessage {
            result_ref,
            outputs,
            cost_units,
            ..CompletionMessage::succeeded(job_id)
        };
        self.record(message).await
    }

    /// Record a failed external completion.
    ///
    /// Idempotent: a job that is already terminal is returned unchanged.
    pub async fn record_failure(&self, job_id: &str, error: impl Into<String>) -> Result<Job> {
        self.record(CompletionMessage::failed(job_id, error)).await
    }

    /// List jobs, newest first.
    pub async fn query_jobs(&self, filter: &JobFilter, page: &Pagination) -> Result<JobPage> {
        if page.limit < 1 || page.limit > MAX_PAGE_SIZE {
            return Err(Error::InvalidParameters(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if page.offset < 0 {
            return Err(Error::InvalidParameters(
                "offset must not be negative".to_string(),
            ));
        }
        if let (Some(after), Some(before)) = (filter.submitted_after, filter.submitted_before)
            && after > before
        {
            return Err(Error::InvalidParameters(
                "submitted_after is later than submitted_before".to_string(),
            ));
        }
        Ok(self.store.query(filter, page).await?)
    }

    /// Registered processes, sorted by id.
    pub fn list_processes(&self) -> Vec<Arc<ProcessDefinition>> {
        self.registry.list()
    }

    /// One process definition.
    pub fn describe_process(&self, process_id: &str) -> Result<Arc<ProcessDefinition>> {
        Ok(self.registry.get(process_id)?)
    }

    /// Drive a claimed async job through its tiers.
    ///
    /// Re-resolves the tenant override and re-runs selection, since the
    /// request that created the job may have been handled on another node.
    pub async fn drive_async(&self, job: &Job) -> Result<CoordinatorOutcome> {
        let definition = match self.registry.get(&job.process_id) {
            Ok(definition) => definition,
            Err(e) => {
                return self
                    .fail_before_execution(job, format!("process unavailable: {}", e))
                    .await;
            }
        };

        let policy = self
            .admission
            .resolve_policy(&job.tenant_id, &job.process_id)
            .await?;
        let provider = self.resolver.resolve(job.dataset_ref.as_deref()).await;
        let selection = self.selector.select(&definition, policy.as_ref(), provider);
        if selection.is_empty() {
            let reasons: Vec<String> = selection
                .removed
                .iter()
                .map(|r| format!("{}: {}", r.tier, r.reason))
                .collect();
            return self
                .fail_before_execution(job, format!("no compatible tier: {}", reasons.join("; ")))
                .await;
        }

        Ok(self
            .coordinator
            .run(job, &definition, &selection.candidates, policy.as_ref())
            .await?)
    }

    async fn record(&self, message: CompletionMessage) -> Result<Job> {
        match reconcile(self.store.as_ref(), &self.admission, &message).await {
            Ok(Reconciled::Applied(job)) => Ok(job),
            Ok(Reconciled::Duplicate(_)) => self.get_job_status(&message.job_id).await,
            Err(CompletionError::UnknownJob(job_id)) => Err(Error::JobNotFound(job_id)),
            Err(CompletionError::NotRunning { job_id, status }) => {
                Err(Error::InvalidState { job_id, status })
            }
            Err(CompletionError::Store(e)) => Err(e.into()),
            Err(e @ CompletionError::Malformed(_)) => Err(Error::InvalidParameters(e.to_string())),
        }
    }

    async fn fail_before_execution(
        &self,
        job: &Job,
        detail: String,
    ) -> Result<CoordinatorOutcome> {
        warn!(job_id = %job.job_id, error = %detail, "Async job cannot be executed");
        let payload = StatusPayload::default().with_error(detail);
        match self
            .store
            .update_status(&job.job_id, JobStatus::Running, JobStatus::Failed, &payload)
            .await?
        {
            Transition::Applied(failed) => {
                self.admission.release(&failed.job_id).await;
                Ok(CoordinatorOutcome::Failed(failed))
            }
            Transition::AlreadyTerminal(status) | Transition::Conflict { actual: status } => {
                Ok(CoordinatorOutcome::Superseded(status))
            }
        }
    }

    /// Leave a sync job that hit a store error somewhere it can finish.
    ///
    /// A job still `running` in sync mode is never claimed by a worker, so it
    /// is handed to the async path. If that fails too, the reservation is
    /// released rather than held by a job nobody drives.
    async fn recover_sync_run(&self, job: &Job) {
        match self.store.requeue_async(&job.job_id, &job.attempts).await {
            Ok(true) => {
                warn!(job_id = %job.job_id, "Sync run failed on the store, handed job to the async path");
            }
            Ok(false) => {
                self.admission.release(&job.job_id).await;
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Could not requeue job after sync run failure");
                self.admission.release(&job.job_id).await;
            }
        }
    }

    /// Map a sync run onto what the caller sees.
    async fn settle(&self, job_id: &str, outcome: CoordinatorOutcome) -> Result<SubmitOutcome> {
        let job = match outcome {
            CoordinatorOutcome::Succeeded(job) => return Ok(SubmitOutcome::Completed(job)),
            CoordinatorOutcome::Submitted(job) | CoordinatorOutcome::Degraded(job) => {
                return Ok(SubmitOutcome::Accepted(job));
            }
            CoordinatorOutcome::Failed(job) => job,
            CoordinatorOutcome::Superseded(_) | CoordinatorOutcome::AlreadyRunning => {
                self.store.get_required(job_id).await?
            }
        };

        match job.status {
            JobStatus::Succeeded => Ok(SubmitOutcome::Completed(job)),
            JobStatus::Failed => Err(Error::ExecutionFailed {
                tier: job
                    .attempts
                    .iter()
                    .rev()
                    .find(|a| a.outcome == AttemptOutcome::Failed)
                    .map(|a| a.tier),
                detail: job.error_detail.clone().unwrap_or_default(),
                job_id: job.job_id,
            }),
            JobStatus::Cancelled => Err(Error::InvalidState {
                job_id: job.job_id,
                status: job.status,
            }),
            JobStatus::Queued | JobStatus::Running => Ok(SubmitOutcome::Accepted(job)),
        }
    }
}
