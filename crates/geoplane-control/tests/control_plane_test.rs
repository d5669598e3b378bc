// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the control plane request path: admission, selection,
//! coordination and the job record they produce.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use geoplane_control::admission::{AdmissionController, AdmissionDecision, AdmissionRequest};
use geoplane_control::executor::{ExecutorSet, MockExecutor};
use geoplane_control::policy::StaticPolicySource;
use geoplane_control::registry::ProcessRegistry;
use geoplane_control::{ControlPlane, Error, SubmitOutcome, SubmitRequest};
use geoplane_core::{
    AttemptOutcome, CancelOutcome, CoreError, ExecutionMode, Job, JobFilter, JobPage, JobStatus,
    JobStore, NewJob, Pagination, ResourceClass, SqliteJobStore, StatusPayload, Tier, TierAttempt,
    Transition,
};
use serde_json::json;

fn buffer_request(mode: ExecutionMode) -> SubmitRequest {
    SubmitRequest::new("acme", "buffer", json!({"distance": 25, "units": "m"}), mode)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_incompatible_db_tier_runs_locally() {
    let db = Arc::new(MockExecutor::succeeding(Tier::DbNative));
    let local = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
    let ctx = TestContext::new(ExecutorSet::new().with(db.clone()).with(local.clone())).await;

    let outcome = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync).with_dataset(S3_DATASET))
        .await
        .unwrap();

    let SubmitOutcome::Completed(job) = outcome else {
        panic!("expected inline completion, got {:?}", outcome);
    };
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.executed_tier, Some(Tier::FastLocal));
    assert!(job.result_ref.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(db.calls(), 0, "db_native was filtered out before execution");
    assert_eq!(local.calls(), 1);
}

#[tokio::test]
async fn test_scenario_b_no_compatible_tier() {
    let db = Arc::new(MockExecutor::succeeding(Tier::DbNative));
    let ctx = TestContext::new(ExecutorSet::new().with(db.clone())).await;

    let err = ctx
        .plane
        .submit(
            SubmitRequest::new("acme", "dissolve", json!({}), ExecutionMode::Sync)
                .with_dataset(S3_DATASET),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoCompatibleTier { ref process_id, .. } if process_id == "dissolve"));
    assert!(!err.is_retryable());
    assert_eq!(db.calls(), 0);
    assert_eq!(ctx.admission.active_reservations().await, 0);

    let page = ctx
        .plane
        .query_jobs(&JobFilter::default(), &Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total_count, 0, "no job is created without a candidate tier");
}

#[tokio::test]
async fn test_scenario_c_concurrent_admission_respects_quota() {
    let registry = ProcessRegistry::from_json(PROCESSES).unwrap();
    let buffer = registry.get("buffer").unwrap();
    let admission = Arc::new(
        AdmissionController::new(Arc::new(StaticPolicySource::empty()), Duration::from_secs(60))
            .with_tenant_limits("acme", ResourceClass::BurstCpu, concurrency_limits(100)),
    );

    let requests = (0..150).map(|i| {
        let admission = admission.clone();
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let job_id = format!("job-{}", i);
            admission
                .admit(AdmissionRequest {
                    job_id: &job_id,
                    tenant_id: "acme",
                    definition: &buffer,
                })
                .await
                .unwrap()
        })
    });
    let decisions: Vec<AdmissionDecision> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let admitted = decisions.iter().filter(|d| d.is_admitted()).count();
    assert_eq!(admitted, 100);

    let rejected: Vec<_> = decisions
        .iter()
        .filter_map(|d| match d {
            AdmissionDecision::Rejected { retry_after, .. } => Some(*retry_after),
            AdmissionDecision::Admitted { .. } => None,
        })
        .collect();
    assert_eq!(rejected.len(), 50);
    assert!(
        rejected
            .iter()
            .all(|retry_after| retry_after.is_some_and(|d| d > Duration::ZERO))
    );
    assert_eq!(admission.active_reservations().await, 100);
}

#[tokio::test]
async fn test_scenario_d_capacity_rejection_falls_back() {
    let db = Arc::new(MockExecutor::rejecting(Tier::DbNative));
    let local = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
    let ctx = TestContext::new(ExecutorSet::new().with(db.clone()).with(local.clone())).await;

    let outcome = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync).with_dataset(POSTGIS_DATASET))
        .await
        .unwrap();

    let job = outcome.job().clone();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.executed_tier, Some(Tier::FastLocal));
    assert_eq!(job.error_detail, None);
    assert_eq!(job.attempts[0].tier, Tier::DbNative);
    assert_eq!(job.attempts[0].outcome, AttemptOutcome::CapacityRejected);
    assert_eq!(job.attempts[1].outcome, AttemptOutcome::Succeeded);
    assert_eq!(db.calls(), 1);

    let failed = ctx
        .plane
        .query_jobs(
            &JobFilter {
                status: Some(JobStatus::Failed),
                ..JobFilter::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(failed.total_count, 0);
}

// ============================================================================
// Admission surface
// ============================================================================

#[tokio::test]
async fn test_quota_rejection_is_retryable() {
    let ctx = TestContext::builder()
        .executors(ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))))
        .limits("acme", ResourceClass::BurstCpu, concurrency_limits(1))
        .build()
        .await;

    ctx.plane
        .submit(buffer_request(ExecutionMode::Async))
        .await
        .unwrap();
    let err = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Async))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AdmissionRejected { .. }));
    assert!(err.is_retryable());
    assert!(err.retry_after().unwrap() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_cost_cap_rejection_is_not_retryable() {
    let ctx = TestContext::builder()
        .executors(ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))))
        .policy(geoplane_control::policy::TenantPolicyOverride {
            cost_cap: Some(1),
            ..override_for("acme", "buffer")
        })
        .build()
        .await;

    let err = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AdmissionRejected { retry_after: None, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_forced_tier_order_overrides_preference() {
    let db = Arc::new(MockExecutor::succeeding(Tier::DbNative));
    let local = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
    let ctx = TestContext::builder()
        .executors(ExecutorSet::new().with(db.clone()).with(local.clone()))
        .policy(geoplane_control::policy::TenantPolicyOverride {
            forced_tiers: Some(vec![Tier::FastLocal]),
            ..override_for("acme", "buffer")
        })
        .build()
        .await;

    let job = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync).with_dataset(POSTGIS_DATASET))
        .await
        .unwrap()
        .job()
        .clone();

    assert_eq!(job.executed_tier, Some(Tier::FastLocal));
    assert_eq!(db.calls(), 0);
}

#[tokio::test]
async fn test_resource_class_override_is_recorded() {
    let ctx = TestContext::builder()
        .executors(ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))))
        .policy(geoplane_control::policy::TenantPolicyOverride {
            resource_class: Some(ResourceClass::LongTail),
            ..override_for("acme", "buffer")
        })
        .build()
        .await;

    let job = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Async))
        .await
        .unwrap()
        .job()
        .clone();

    assert_eq!(job.resource_class, ResourceClass::LongTail);
    assert_eq!(
        ctx.admission.usage("acme", ResourceClass::LongTail).await.active,
        1
    );
}

#[tokio::test]
async fn test_request_validation() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    let err = ctx
        .plane
        .submit(SubmitRequest::new("acme", "clip", json!({}), ExecutionMode::Sync))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProcessNotFound(ref id) if id == "clip"));

    let err = ctx
        .plane
        .submit(SubmitRequest::new(
            "acme",
            "buffer",
            json!({"distance": "far"}),
            ExecutionMode::Sync,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameters(ref msg) if msg.contains("distance")));

    let err = ctx
        .plane
        .submit(SubmitRequest::new("acme", "hotspot", json!({}), ExecutionMode::Sync))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameters(_)));

    assert_eq!(ctx.admission.active_reservations().await, 0);
}

// ============================================================================
// Execution outcomes
// ============================================================================

#[tokio::test]
async fn test_execution_failure_surfaces_without_fallback() {
    let db = Arc::new(MockExecutor::failing(Tier::DbNative));
    let local = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
    let ctx = TestContext::new(ExecutorSet::new().with(db).with(local.clone())).await;

    let err = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync).with_dataset(POSTGIS_DATASET))
        .await
        .unwrap_err();

    let Error::ExecutionFailed {
        job_id,
        tier,
        detail,
    } = err
    else {
        panic!("expected ExecutionFailed, got {:?}", err);
    };
    assert_eq!(tier, Some(Tier::DbNative));
    assert_eq!(detail, "mock failure");
    assert_eq!(local.calls(), 0);

    let job = ctx.plane.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(!ctx.admission.holds_reservation(&job_id).await);
}

#[tokio::test]
async fn test_all_tiers_rejected_fails_job() {
    let ctx = TestContext::new(
        ExecutorSet::new()
            .with(Arc::new(MockExecutor::rejecting(Tier::DbNative)))
            .with(Arc::new(MockExecutor::rejecting(Tier::FastLocal))),
    )
    .await;

    let err = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync).with_dataset(POSTGIS_DATASET))
        .await
        .unwrap_err();

    let Error::ExecutionFailed { job_id, tier, .. } = err else {
        panic!("expected ExecutionFailed, got {:?}", err);
    };
    assert_eq!(tier, None);

    let job = ctx.plane.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let tried: Vec<_> = job.attempts.iter().map(|a| a.tier).collect();
    assert_eq!(tried, vec![Tier::DbNative, Tier::FastLocal]);
    assert!(job.error_detail.unwrap().contains("mock db_native is full"));
    assert_eq!(ctx.admission.active_reservations().await, 0);
}

#[tokio::test]
async fn test_sync_timeout_returns_accepted_running_job() {
    let local = Arc::new(
        MockExecutor::hanging(Tier::FastLocal).with_target_latency(Duration::from_millis(10)),
    );
    let ctx = TestContext::builder()
        .executors(ExecutorSet::new().with(local))
        .guard_band(Duration::from_millis(40))
        .build()
        .await;

    let outcome = ctx
        .plane
        .submit(buffer_request(ExecutionMode::Sync))
        .await
        .unwrap();

    let SubmitOutcome::Accepted(job) = outcome else {
        panic!("expected degraded acceptance, got {:?}", outcome);
    };
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.mode, ExecutionMode::Async);
    assert_eq!(job.attempts.last().unwrap().outcome, AttemptOutcome::TimedOut);
    assert!(ctx.admission.holds_reservation(&job.job_id).await);
}

#[tokio::test]
async fn test_async_submit_is_queued() {
    let local = Arc::new(MockExecutor::succeeding(Tier::FastLocal));
    let ctx = TestContext::new(ExecutorSet::new().with(local.clone())).await;

    let job = ctx
        .plane
        .enqueue_async(buffer_request(ExecutionMode::Sync))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.mode, ExecutionMode::Async);
    assert_eq!(local.calls(), 0);
}

// ============================================================================
// Cancellation and reservations
// ============================================================================

#[tokio::test]
async fn test_reservation_released_exactly_once() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    let job = ctx
        .plane
        .execute_inline(buffer_request(ExecutionMode::Async))
        .await
        .unwrap()
        .job()
        .clone();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(!ctx.admission.holds_reservation(&job.job_id).await);
    assert!(!ctx.admission.release(&job.job_id).await, "second release is a no-op");

    let outcome = ctx.plane.cancel_job(&job.job_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyTerminal(JobStatus::Succeeded));
    assert_eq!(
        ctx.admission.usage("acme", ResourceClass::BurstCpu).await.active,
        0
    );
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    let job = ctx
        .plane
        .enqueue_async(buffer_request(ExecutionMode::Async))
        .await
        .unwrap();
    assert!(ctx.admission.holds_reservation(&job.job_id).await);

    let CancelOutcome::Cancelled { previous, job } = ctx.plane.cancel_job(&job.job_id).await.unwrap()
    else {
        panic!("expected cancellation");
    };
    assert_eq!(previous, JobStatus::Queued);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!ctx.admission.holds_reservation(&job.job_id).await);

    let claimed = ctx
        .store
        .claim_async(10, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(claimed.is_empty(), "cancelled jobs are never claimed");
}

#[tokio::test]
async fn test_cancel_running_job_signals_executor() {
    let local = Arc::new(
        MockExecutor::hanging(Tier::FastLocal).with_target_latency(Duration::from_secs(30)),
    );
    let ctx = TestContext::new(ExecutorSet::new().with(local.clone())).await;

    let submit = {
        let plane = ctx.plane.clone();
        tokio::spawn(async move { plane.submit(buffer_request(ExecutionMode::Sync)).await })
    };
    while local.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let running = ctx
        .plane
        .query_jobs(
            &JobFilter {
                status: Some(JobStatus::Running),
                ..JobFilter::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    let job_id = running.jobs[0].job_id.clone();

    let outcome = ctx.plane.cancel_job(&job_id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled { previous: JobStatus::Running, .. }));

    let err = submit.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::InvalidState { status: JobStatus::Cancelled, .. }));
    assert_eq!(local.cancellations(), 1);

    let job = ctx.plane.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(ctx.admission.active_reservations().await, 0);
}

// ============================================================================
// Completions recorded through the facade
// ============================================================================

#[tokio::test]
async fn test_record_completion_is_idempotent() {
    let batch = Arc::new(MockExecutor::submitting(Tier::CloudBatch));
    let ctx = TestContext::new(ExecutorSet::new().with(batch)).await;

    let job = ctx
        .plane
        .enqueue_async(SubmitRequest::new("acme", "hotspot", json!({}), ExecutionMode::Async))
        .await
        .unwrap();
    let claimed = ctx.store.claim_async(1, Duration::from_secs(60)).await.unwrap();
    ctx.plane.drive_async(&claimed[0]).await.unwrap();

    let done = ctx
        .plane
        .record_completion(&job.job_id, Some("s3://out/hotspot".to_string()), None, Some(40))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.executed_tier, Some(Tier::CloudBatch));
    assert_eq!(done.cost_units, 40);

    let again = ctx
        .plane
        .record_failure(&job.job_id, "late failure report")
        .await
        .unwrap();
    assert_eq!(again, done, "the first terminal write wins");
    assert!(!ctx.admission.holds_reservation(&job.job_id).await);
}

#[tokio::test]
async fn test_record_completion_errors() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    let err = ctx
        .plane
        .record_completion("missing", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));

    let queued = ctx
        .plane
        .enqueue_async(buffer_request(ExecutionMode::Async))
        .await
        .unwrap();
    let err = ctx
        .plane
        .record_failure(&queued.job_id, "boom")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { status: JobStatus::Queued, .. }));
}

// ============================================================================
// Queries and catalog
// ============================================================================

#[tokio::test]
async fn test_query_jobs_filters_and_validates() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    for tenant in ["acme", "acme", "globex"] {
        ctx.plane
            .submit(SubmitRequest::new(
                tenant,
                "buffer",
                json!({"distance": 1}),
                ExecutionMode::Async,
            ))
            .await
            .unwrap();
    }

    let page = ctx
        .plane
        .query_jobs(
            &JobFilter {
                tenant_id: Some("acme".to_string()),
                ..JobFilter::default()
            },
            &Pagination { limit: 1, offset: 0 },
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);
    assert_eq!(page.jobs.len(), 1);

    let err = ctx
        .plane
        .query_jobs(&JobFilter::default(), &Pagination { limit: 0, offset: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameters(_)));

    let err = ctx
        .plane
        .query_jobs(&JobFilter::default(), &Pagination { limit: 10, offset: -1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameters(_)));
}

#[tokio::test]
async fn test_process_catalog() {
    let ctx = TestContext::new(
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    )
    .await;

    let ids: Vec<_> = ctx
        .plane
        .list_processes()
        .iter()
        .map(|p| p.id.clone())
        .collect();
    assert_eq!(ids, vec!["buffer", "dissolve", "hotspot"]);

    let hotspot = ctx.plane.describe_process("hotspot").unwrap();
    assert_eq!(hotspot.version, "2.1.0");
    assert!(!hotspot.allows_mode(ExecutionMode::Sync));

    assert!(matches!(
        ctx.plane.describe_process("clip"),
        Err(Error::ProcessNotFound(_))
    ));
}

// ============================================================================
// Store failures on the sync path
// ============================================================================

/// SQLite store whose writes can be switched to fail.
struct FlakyStore {
    inner: SqliteJobStore,
    fail_updates: AtomicBool,
    fail_requeues: AtomicBool,
}

impl FlakyStore {
    async fn new() -> Self {
        Self {
            inner: SqliteJobStore::connect("sqlite::memory:", 1).await.unwrap(),
            fail_updates: AtomicBool::new(false),
            fail_requeues: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> geoplane_core::Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoreError::database(operation, "connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, job: &NewJob) -> geoplane_core::Result<Job> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &str) -> geoplane_core::Result<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        payload: &StatusPayload,
    ) -> geoplane_core::Result<Transition> {
        Self::check(&self.fail_updates, "update_status")?;
        self.inner.update_status(job_id, expected, next, payload).await
    }

    async fn query(&self, filter: &JobFilter, page: &Pagination) -> geoplane_core::Result<JobPage> {
        self.inner.query(filter, page).await
    }

    async fn claim_async(&self, limit: i64, lease: Duration) -> geoplane_core::Result<Vec<Job>> {
        self.inner.claim_async(limit, lease).await
    }

    async fn requeue_async(
        &self,
        job_id: &str,
        attempts: &[TierAttempt],
    ) -> geoplane_core::Result<bool> {
        Self::check(&self.fail_requeues, "requeue_async")?;
        self.inner.requeue_async(job_id, attempts).await
    }

    async fn mark_submitted(
        &self,
        job_id: &str,
        tier: Tier,
        attempts: &[TierAttempt],
    ) -> geoplane_core::Result<Option<Job>> {
        self.inner.mark_submitted(job_id, tier, attempts).await
    }

    async fn heartbeat_lease(&self, job_id: &str, lease: Duration) -> geoplane_core::Result<bool> {
        self.inner.heartbeat_lease(job_id, lease).await
    }

    async fn record_attempts(
        &self,
        job_id: &str,
        attempts: &[TierAttempt],
    ) -> geoplane_core::Result<bool> {
        self.inner.record_attempts(job_id, attempts).await
    }

    async fn health_check(&self) -> geoplane_core::Result<bool> {
        self.inner.health_check().await
    }
}

fn flaky_plane(store: Arc<FlakyStore>) -> (ControlPlane, Arc<AdmissionController>) {
    let admission = Arc::new(AdmissionController::new(
        Arc::new(StaticPolicySource::empty()),
        Duration::from_secs(60),
    ));
    let plane = ControlPlane::new(
        store,
        Arc::new(ProcessRegistry::from_json(PROCESSES).unwrap()),
        admission.clone(),
        ExecutorSet::new().with(Arc::new(MockExecutor::succeeding(Tier::FastLocal))),
    );
    (plane, admission)
}

#[tokio::test]
async fn test_sync_store_failure_hands_job_to_async_path() {
    let store = Arc::new(FlakyStore::new().await);
    let (plane, admission) = flaky_plane(store.clone());
    store.fail_updates.store(true, Ordering::SeqCst);

    let err = plane
        .submit(buffer_request(ExecutionMode::Sync))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(CoreError::DatabaseError { .. })));

    let page = store
        .query(&JobFilter::default(), &Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.jobs.len(), 1);
    let job_id = page.jobs[0].job_id.clone();
    assert_eq!(page.jobs[0].mode, ExecutionMode::Async);
    assert!(
        admission.holds_reservation(&job_id).await,
        "the async worker finishes the job and releases the slot"
    );

    let claimed = store.claim_async(10, Duration::from_secs(60)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, job_id);
}

#[tokio::test]
async fn test_sync_store_failure_without_requeue_releases_reservation() {
    let store = Arc::new(FlakyStore::new().await);
    let (plane, admission) = flaky_plane(store.clone());
    store.fail_updates.store(true, Ordering::SeqCst);
    store.fail_requeues.store(true, Ordering::SeqCst);

    let err = plane
        .submit(buffer_request(ExecutionMode::Sync))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(admission.active_reservations().await, 0);
}
