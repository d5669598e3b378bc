// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution coordinator.
//!
//! Walks a job's candidate tiers in order. Only an explicit capacity
//! rejection advances to the next tier; a fatal tier error fails the job at
//! once. Synchronous calls carry a deadline of the tier's target latency plus
//! a guard band. When it elapses the in-flight call is cancelled and the job
//! is handed to the async path instead of failing.
//!
//! The coordinator never writes status directly. Every outcome is proposed to
//! the job store as a compare-and-swap from `running`; if another writer got
//! there first (cancellation, a completion message) the coordinator reports
//! [`CoordinatorOutcome::Superseded`] and leaves the record alone.
//!
//! At most one run per job is in flight on a coordinator. A second run for the
//! same job is refused with [`CoordinatorOutcome::AlreadyRunning`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use geoplane_core::{
    AttemptOutcome, CoreError, ExecutionMode, Job, JobStatus, JobStore, StatusPayload, Tier,
    TierAttempt, Transition,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::executor::{ExecutorSet, TierError, TierOutput, TierRequest};
use crate::policy::TenantPolicyOverride;
use crate::registry::ProcessDefinition;

/// Default guard band added to a tier's target latency on the sync path.
pub const DEFAULT_GUARD_BAND: Duration = Duration::from_secs(2);

/// How a coordinator run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorOutcome {
    /// A tier produced a result; the job is `succeeded`.
    Succeeded(Job),
    /// A tier failed fatally or every tier rejected; the job is `failed`.
    Failed(Job),
    /// A tier accepted the job for external execution; the job stays
    /// `running` until a completion message arrives.
    Submitted(Job),
    /// The synchronous deadline elapsed; the job stays `running` and waits
    /// for an async worker.
    Degraded(Job),
    /// Another writer moved the job first; nothing was written.
    Superseded(JobStatus),
    /// A run for this job is already in flight; this one did nothing.
    AlreadyRunning,
}

impl CoordinatorOutcome {
    /// Whether the job reached a terminal status during this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

struct InFlightRun {
    run_id: u64,
    token: CancellationToken,
}

/// Drives tier attempts for running jobs.
pub struct ExecutionCoordinator {
    store: Arc<dyn JobStore>,
    executors: ExecutorSet,
    admission: Arc<AdmissionController>,
    guard_band: Duration,
    in_flight: Mutex<HashMap<String, InFlightRun>>,
    next_run_id: AtomicU64,
}

impl ExecutionCoordinator {
    /// Create a coordinator with the default guard band.
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: ExecutorSet,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            store,
            executors,
            admission,
            guard_band: DEFAULT_GUARD_BAND,
            in_flight: Mutex::new(HashMap::new()),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Set the guard band added to each tier's target latency.
    pub fn with_guard_band(mut self, guard_band: Duration) -> Self {
        self.guard_band = guard_band;
        self
    }

    /// Registered executors.
    pub fn executors(&self) -> &ExecutorSet {
        &self.executors
    }

    /// Run a `running` job through `candidates`.
    ///
    /// Reservation release is tied to the terminal write: the reservation is
    /// released only when this run's compare-and-swap is the one that applied.
    pub async fn run(
        &self,
        job: &Job,
        definition: &ProcessDefinition,
        candidates: &[Tier],
        policy: Option<&TenantPolicyOverride>,
    ) -> Result<CoordinatorOutcome, CoreError> {
        let Some((run_id, token)) = self.register(&job.job_id).await else {
            warn!(job_id = %job.job_id, "Job already has a run in flight, refusing a second one");
            return Ok(CoordinatorOutcome::AlreadyRunning);
        };

        let outcome = self
            .walk(job, definition, candidates, policy, run_id, &token)
            .await;

        self.unregister(&job.job_id, run_id).await;
        outcome
    }

    /// Raise the cancellation signal of an in-flight run.
    ///
    /// Returns true if a run was signalled. The signal is raised at most once
    /// per run; later calls find nothing to cancel.
    pub async fn signal_cancel(&self, job_id: &str) -> bool {
        let Some(run) = self.in_flight.lock().await.remove(job_id) else {
            return false;
        };
        info!(job_id = %job_id, run_id = run.run_id, "Signalling cancellation to in-flight tier call");
        run.token.cancel();
        true
    }

    /// Number of runs currently in progress.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn register(&self, job_id: &str) -> Option<(u64, CancellationToken)> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(job_id) {
            return None;
        }
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        in_flight.insert(
            job_id.to_string(),
            InFlightRun {
                run_id,
                token: token.clone(),
            },
        );
        Some((run_id, token))
    }

    /// Drop the entry of `run_id` only; a later run of the job may own the slot.
    async fn unregister(&self, job_id: &str, run_id: u64) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(job_id).is_some_and(|run| run.run_id == run_id) {
            in_flight.remove(job_id);
        }
    }

    async fn walk(
        &self,
        job: &Job,
        definition: &ProcessDefinition,
        candidates: &[Tier],
        policy: Option<&TenantPolicyOverride>,
        run_id: u64,
        token: &CancellationToken,
    ) -> Result<CoordinatorOutcome, CoreError> {
        let limits = self
            .admission
            .limits_for(&job.tenant_id, job.resource_class);
        let cost_cap = policy.and_then(|p| p.cost_cap);
        let mut attempts = job.attempts.clone();

        for &tier in candidates {
            let Some(executor) = self.executors.get(tier) else {
                warn!(job_id = %job.job_id, tier = %tier, "No executor registered for tier");
                attempts.push(TierAttempt::new(
                    tier,
                    AttemptOutcome::CapacityRejected,
                    "no executor registered",
                ));
                continue;
            };
            let Some(handler) = definition.handler_for(tier) else {
                attempts.push(TierAttempt::new(
                    tier,
                    AttemptOutcome::CapacityRejected,
                    "process has no handler bound on this tier",
                ));
                continue;
            };

            let request = TierRequest::for_job(job, handler, limits.max_duration)
                .with_cost_cap(cost_cap);
            let deadline = match job.mode {
                ExecutionMode::Sync => executor.target_latency() + self.guard_band,
                ExecutionMode::Async => limits.max_duration,
            };
            let call_token = token.child_token();

            if executor.completes_out_of_band() {
                let mut trail = attempts.clone();
                trail.push(TierAttempt::new(tier, AttemptOutcome::Dispatched, "dispatching"));
                if !self.store.record_attempts(&job.job_id, &trail).await? {
                    let current = self.store.get_required(&job.job_id).await?;
                    debug!(job_id = %job.job_id, status = %current.status, "Job moved before dispatch");
                    return Ok(CoordinatorOutcome::Superseded(current.status));
                }
            }

            info!(
                job_id = %job.job_id,
                tier = %tier,
                mode = %job.mode,
                deadline_ms = deadline.as_millis() as u64,
                "Attempting tier"
            );

            let result =
                tokio::time::timeout(deadline, executor.execute(&request, call_token.clone()))
                    .await;

            match result {
                Err(_) => {
                    // Dropping the call future aborts it here; the token
                    // reaches any work the executor spawned.
                    call_token.cancel();
                    return match job.mode {
                        ExecutionMode::Sync => {
                            attempts.push(TierAttempt::new(
                                tier,
                                AttemptOutcome::TimedOut,
                                format!("no result within {}ms", deadline.as_millis()),
                            ));
                            self.degrade(job, tier, &attempts, run_id).await
                        }
                        ExecutionMode::Async => {
                            let detail = format!(
                                "exceeded the {}s limit of {}",
                                limits.max_duration.as_secs(),
                                job.resource_class
                            );
                            attempts.push(TierAttempt::new(tier, AttemptOutcome::Failed, &detail));
                            self.fail(job, detail, attempts).await
                        }
                    };
                }
                Ok(Err(TierError::CapacityRejected(reason))) => {
                    info!(
                        job_id = %job.job_id,
                        tier = %tier,
                        reason = %reason,
                        "Tier rejected for capacity, falling back"
                    );
                    attempts.push(TierAttempt::new(tier, AttemptOutcome::CapacityRejected, reason));
                }
                Ok(Err(TierError::ExecutionFailed(detail))) => {
                    warn!(job_id = %job.job_id, tier = %tier, error = %detail, "Tier execution failed");
                    attempts.push(TierAttempt::new(tier, AttemptOutcome::Failed, &detail));
                    return self.fail(job, detail, attempts).await;
                }
                Ok(Err(TierError::Cancelled)) => {
                    info!(job_id = %job.job_id, tier = %tier, "Tier call observed cancellation");
                    attempts.push(TierAttempt::new(
                        tier,
                        AttemptOutcome::Cancelled,
                        "execution cancelled",
                    ));
                    return self
                        .fail(job, "execution cancelled".to_string(), attempts)
                        .await;
                }
                Ok(Ok(TierOutput::Completed {
                    result_ref,
                    outputs,
                    cost_units,
                })) => {
                    attempts.push(TierAttempt::new(tier, AttemptOutcome::Succeeded, "completed"));
                    let mut payload = StatusPayload::default()
                        .with_tier(tier)
                        .with_cost(cost_units)
                        .with_attempts(attempts);
                    payload.result_ref = result_ref;
                    payload.outputs = outputs;
                    let applied = self.finish(job, JobStatus::Succeeded, &payload).await?;
                    return Ok(applied.map_or_else(
                        CoordinatorOutcome::Superseded,
                        CoordinatorOutcome::Succeeded,
                    ));
                }
                Ok(Ok(TierOutput::Submitted { external_ref })) => {
                    attempts.push(TierAttempt::new(
                        tier,
                        AttemptOutcome::Submitted,
                        format!("submitted as {}", external_ref),
                    ));
                    return self.submitted(job, tier, &attempts).await;
                }
            }
        }

        let reasons: Vec<String> = attempts
            .iter()
            .map(|a| format!("{}: {}", a.tier, a.reason))
            .collect();
        warn!(job_id = %job.job_id, attempts = attempts.len(), "Every candidate tier rejected the job");
        self.fail(
            job,
            format!("no tier accepted the job: {}", reasons.join("; ")),
            attempts,
        )
        .await
    }

    async fn fail(
        &self,
        job: &Job,
        detail: String,
        attempts: Vec<TierAttempt>,
    ) -> Result<CoordinatorOutcome, CoreError> {
        let payload = StatusPayload::default()
            .with_error(detail)
            .with_attempts(attempts);
        let applied = self.finish(job, JobStatus::Failed, &payload).await?;
        Ok(applied.map_or_else(CoordinatorOutcome::Superseded, CoordinatorOutcome::Failed))
    }

    /// Propose `running -> next`. `Ok(Err(status))` means another writer won.
    async fn finish(
        &self,
        job: &Job,
        next: JobStatus,
        payload: &StatusPayload,
    ) -> Result<Result<Job, JobStatus>, CoreError> {
        match self
            .store
            .update_status(&job.job_id, JobStatus::Running, next, payload)
            .await?
        {
            Transition::Applied(updated) => {
                info!(
                    job_id = %updated.job_id,
                    status = %updated.status,
                    executed_tier = ?updated.executed_tier,
                    "Job finished"
                );
                self.admission.release(&updated.job_id).await;
                Ok(Ok(updated))
            }
            Transition::AlreadyTerminal(status) => {
                info!(job_id = %job.job_id, status = %status, "Job already terminal, outcome dropped");
                Ok(Err(status))
            }
            Transition::Conflict { actual } => {
                error!(job_id = %job.job_id, actual = %actual, "Job left running during execution");
                Ok(Err(actual))
            }
        }
    }

    async fn degrade(
        &self,
        job: &Job,
        tier: Tier,
        attempts: &[TierAttempt],
        run_id: u64,
    ) -> Result<CoordinatorOutcome, CoreError> {
        // Free the slot first so the worker that claims the job can run it.
        self.unregister(&job.job_id, run_id).await;
        if self.store.requeue_async(&job.job_id, attempts).await? {
            info!(job_id = %job.job_id, tier = %tier, "Synchronous deadline elapsed, degraded to async");
            let job = self.store.get_required(&job.job_id).await?;
            return Ok(CoordinatorOutcome::Degraded(job));
        }
        let current = self.store.get_required(&job.job_id).await?;
        debug!(job_id = %job.job_id, status = %current.status, "Job moved before it could be requeued");
        Ok(CoordinatorOutcome::Superseded(current.status))
    }

    async fn submitted(
        &self,
        job: &Job,
        tier: Tier,
        attempts: &[TierAttempt],
    ) -> Result<CoordinatorOutcome, CoreError> {
        match self.store.mark_submitted(&job.job_id, tier, attempts).await? {
            Some(job) => {
                info!(job_id = %job.job_id, tier = %tier, "Job handed to external execution");
                Ok(CoordinatorOutcome::Submitted(job))
            }
            None => {
                let current = self.store.get_required(&job.job_id).await?;
                Ok(CoordinatorOutcome::Superseded(current.status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionDecision, AdmissionRequest};
    use crate::executor::{MockExecutor, TierExecutor};
    use crate::listener::{CompletionMessage, Reconciled, reconcile};
    use crate::policy::StaticPolicySource;
    use crate::registry::ProcessRegistry;
    use geoplane_core::{NewJob, SqliteJobStore};
    use serde_json::json;

    struct Harness {
        store: Arc<dyn JobStore>,
        admission: Arc<AdmissionController>,
        definition: Arc<ProcessDefinition>,
    }

    impl Harness {
        async fn new() -> Self {
            let store = SqliteJobStore::connect("sqlite::memory:", 1).await.unwrap();
            let registry = ProcessRegistry::from_json(
                r#"
                [{"id": "buffer", "tiers": ["db_native", "fast_local", "cloud_batch"],
                  "handlers": {"db_native": "st_buffer", "fast_local": "buffer", "cloud_batch": "buffer"},
                  "default_resource_class": "burst_cpu"}]
                "#,
            )
            .unwrap();
            Self {
                store: Arc::new(store),
                admission: Arc::new(AdmissionController::new(
                    Arc::new(StaticPolicySource::empty()),
                    Duration::from_secs(60),
                )),
                definition: registry.get("buffer").unwrap(),
            }
        }

        async fn job(&self, mode: ExecutionMode) -> Job {
            let job_id = NewJob::generate_id();
            let decision = self
                .admission
                .admit(AdmissionRequest {
                    job_id: &job_id,
                    tenant_id: "acme",
                    definition: &self.definition,
                })
                .await
                .unwrap();
            assert!(matches!(decision, AdmissionDecision::Admitted { .. }));
            let job = self
                .store
                .create(&NewJob {
                    job_id,
                    process_id: "buffer".to_string(),
                    tenant_id: "acme".to_string(),
                    parameters: json!({"distance": 5}),
                    dataset_ref: None,
                    resource_class: decision.resource_class(),
                    mode,
                    trace_id: "trace".to_string(),
                })
                .await
                .unwrap();
            if mode == ExecutionMode::Async {
                return self
                    .store
                    .claim_async(1, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .remove(0);
            }
            job
        }

        fn coordinator(&self, executors: ExecutorSet) -> ExecutionCoordinator {
            ExecutionCoordinator::new(self.store.clone(), executors, self.admission.clone())
                .with_guard_band(Duration::from_millis(50))
        }
    }

    #[tokio::test]
    async fn test_capacity_rejection_falls_back() {
        let h = Harness::new().await;
        let rejecting = Arc::new(MockExecutor::rejecting(Tier::DbNative));
        let succeeding = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
        let coordinator = h.coordinator(
            ExecutorSet::new()
                .with(rejecting.clone())
                .with(succeeding.clone()),
        );
        let job = h.job(ExecutionMode::Sync).await;

        let outcome = coordinator
            .run(&job, &h.definition, &[Tier::DbNative, Tier::FastLocal], None)
            .await
            .unwrap();

        let CoordinatorOutcome::Succeeded(done) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(done.executed_tier, Some(Tier::FastLocal));
        assert_eq!(done.attempts.len(), 2);
        assert_eq!(done.attempts[0].outcome, AttemptOutcome::CapacityRejected);
        assert_eq!(rejecting.calls(), 1);
        assert_eq!(succeeding.calls(), 1);
        assert!(!h.admission.holds_reservation(&job.job_id).await);
    }

    #[tokio::test]
    async fn test_execution_failure_does_not_fall_back() {
        let h = Harness::new().await;
        let failing = Arc::new(MockExecutor::failing(Tier::DbNative));
        let never_called = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
        let coordinator =
            h.coordinator(ExecutorSet::new().with(failing).with(never_called.clone()));
        let job = h.job(ExecutionMode::Sync).await;

        let outcome = coordinator
            .run(&job, &h.definition, &[Tier::DbNative, Tier::FastLocal], None)
            .await
            .unwrap();

        let CoordinatorOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(failed.error_detail.as_deref(), Some("mock failure"));
        assert_eq!(failed.executed_tier, None);
        assert_eq!(never_called.calls(), 0);
        assert!(!h.admission.holds_reservation(&job.job_id).await);
    }

    #[tokio::test]
    async fn test_all_tiers_rejected_aggregates_reasons() {
        let h = Harness::new().await;
        let coordinator = h.coordinator(
            ExecutorSet::new()
                .with(Arc::new(MockExecutor::rejecting(Tier::DbNative)))
                .with(Arc::new(MockExecutor::rejecting(Tier::FastLocal))),
        );
        let job = h.job(ExecutionMode::Sync).await;

        let outcome = coordinator
            .run(
                &job,
                &h.definition,
                &[Tier::DbNative, Tier::FastLocal, Tier::CloudBatch],
                None,
            )
            .await
            .unwrap();

        let CoordinatorOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        let detail = failed.error_detail.unwrap();
        assert!(detail.contains("db_native: mock db_native is full"));
        assert!(detail.contains("fast_local: mock fast_local is full"));
        assert!(detail.contains("cloud_batch: no executor registered"));
        assert_eq!(failed.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_sync_timeout_degrades_to_async() {
        let h = Harness::new().await;
        let hanging = Arc::new(
            MockExecutor::hanging(Tier::FastLocal).with_target_latency(Duration::from_millis(20)),
        );
        let coordinator = h.coordinator(ExecutorSet::new().with(hanging.clone()));
        let job = h.job(ExecutionMode::Sync).await;

        let outcome = coordinator
            .run(&job, &h.definition, &[Tier::FastLocal], None)
            .await
            .unwrap();

        let CoordinatorOutcome::Degraded(degraded) = outcome else {
            panic!("expected degradation, got {:?}", outcome);
        };
        assert_eq!(degraded.status, JobStatus::Running);
        assert_eq!(degraded.mode, ExecutionMode::Async);
        assert_eq!(degraded.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert!(h.admission.holds_reservation(&job.job_id).await);
        assert_eq!(coordinator.in_flight().await, 0);

        let claimed = h.store.claim_async(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn test_submission_leaves_job_running() {
        let h = Harness::new().await;
        let coordinator =
            h.coordinator(ExecutorSet::new().with(Arc::new(MockExecutor::submitting(Tier::CloudBatch))));
        let job = h.job(ExecutionMode::Async).await;

        let outcome = coordinator
            .run(&job, &h.definition, &[Tier::CloudBatch], None)
            .await
            .unwrap();

        let CoordinatorOutcome::Submitted(submitted) = outcome else {
            panic!("expected submission, got {:?}", outcome);
        };
        assert_eq!(submitted.status, JobStatus::Running);
        assert_eq!(submitted.executed_tier, Some(Tier::CloudBatch));
        assert!(h.admission.holds_reservation(&job.job_id).await);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_superseded() {
        let h = Harness::new().await;
        let hanging = Arc::new(
            MockExecutor::hanging(Tier::FastLocal).with_target_latency(Duration::from_secs(30)),
        );
        let coordinator = Arc::new(h.coordinator(ExecutorSet::new().with(hanging.clone())));
        let job = h.job(ExecutionMode::Sync).await;

        let run = {
            let coordinator = coordinator.clone();
            let definition = h.definition.clone();
            let job = job.clone();
            tokio::spawn(async move {
                coordinator
                    .run(&job, &definition, &[Tier::FastLocal], None)
                    .await
            })
        };
        while hanging.calls() == 0 {
            tokio::task::yield_now().await;
        }

        h.store.cancel(&job.job_id).await.unwrap();
        assert!(coordinator.signal_cancel(&job.job_id).await);
        assert!(!coordinator.signal_cancel(&job.job_id).await, "signal raised once");

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, CoordinatorOutcome::Superseded(JobStatus::Cancelled));
        assert_eq!(hanging.cancellations(), 1);
    }

    #[tokio::test]
    async fn test_second_run_of_same_job_is_refused() {
        let h = Harness::new().await;
        let hanging = Arc::new(
            MockExecutor::hanging(Tier::FastLocal).with_target_latency(Duration::from_secs(30)),
        );
        let coordinator = Arc::new(h.coordinator(ExecutorSet::new().with(hanging.clone())));
        let job = h.job(ExecutionMode::Async).await;

        let first = {
            let coordinator = coordinator.clone();
            let definition = h.definition.clone();
            let job = job.clone();
            tokio::spawn(async move {
                coordinator
                    .run(&job, &definition, &[Tier::FastLocal], None)
                    .await
            })
        };
        while hanging.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let second = coordinator
            .run(&job, &h.definition, &[Tier::FastLocal], None)
            .await
            .unwrap();
        assert_eq!(second, CoordinatorOutcome::AlreadyRunning);
        assert_eq!(hanging.calls(), 1, "the refused run never reached a tier");
        assert_eq!(coordinator.in_flight().await, 1);

        // The first run still owns the cancellation signal.
        assert!(coordinator.signal_cancel(&job.job_id).await);
        let outcome = first.await.unwrap().unwrap();
        let CoordinatorOutcome::Failed(failed) = outcome else {
            panic!("expected the cancelled run to fail, got {:?}", outcome);
        };
        assert_eq!(failed.error_detail.as_deref(), Some("execution cancelled"));
        assert_eq!(hanging.cancellations(), 1);
        assert_eq!(coordinator.in_flight().await, 0);
    }

    /// Batch tier whose completion is reconciled before `execute` returns.
    struct CompletesBeforeReturning {
        store: Arc<dyn JobStore>,
        admission: Arc<AdmissionController>,
    }

    #[async_trait::async_trait]
    impl TierExecutor for CompletesBeforeReturning {
        fn tier(&self) -> Tier {
            Tier::CloudBatch
        }

        fn target_latency(&self) -> Duration {
            Duration::from_millis(100)
        }

        fn completes_out_of_band(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            request: &TierRequest,
            _cancel: CancellationToken,
        ) -> crate::executor::Result<TierOutput> {
            let message = CompletionMessage::succeeded(&request.job_id).with_cost(7);
            let reconciled = reconcile(self.store.as_ref(), &self.admission, &message)
                .await
                .map_err(|e| TierError::ExecutionFailed(e.to_string()))?;
            assert!(matches!(reconciled, Reconciled::Applied(_)));
            Ok(TierOutput::Submitted {
                external_ref: "batch-7".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_completion_before_submission_keeps_tier_and_trail() {
        let h = Harness::new().await;
        let batch = Arc::new(CompletesBeforeReturning {
            store: h.store.clone(),
            admission: h.admission.clone(),
        });
        let coordinator = h.coordinator(
            ExecutorSet::new()
                .with(Arc::new(MockExecutor::rejecting(Tier::FastLocal)))
                .with(batch),
        );
        let job = h.job(ExecutionMode::Async).await;

        let outcome = coordinator
            .run(&job, &h.definition, &[Tier::FastLocal, Tier::CloudBatch], None)
            .await
            .unwrap();
        assert_eq!(outcome, CoordinatorOutcome::Superseded(JobStatus::Succeeded));

        let done = h.store.get_required(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.executed_tier, Some(Tier::CloudBatch));
        assert_eq!(done.cost_units, 7);
        let outcomes: Vec<_> = done.attempts.iter().map(|a| (a.tier, a.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (Tier::FastLocal, AttemptOutcome::CapacityRejected),
                (Tier::CloudBatch, AttemptOutcome::Dispatched),
            ]
        );
        assert!(!h.admission.holds_reservation(&job.job_id).await);
    }
}
