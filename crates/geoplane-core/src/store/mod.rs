// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job store interface and backends.
//!
//! The job store is the single owner of job status. Every status change goes
//! through [`JobStore::update_status`], a compare-and-swap against the status
//! the caller last observed. Other components only propose transitions.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresJobStore;
pub use self::sqlite::SqliteJobStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::job::{ExecutionMode, Job, JobStatus, NewJob, Tier, TierAttempt};
use crate::resource::ResourceClass;

/// Optional fields written together with a status change.
///
/// `None` leaves the stored value untouched. `executed_tier` is only written
/// when the stored value is empty, and `cost_units` only ever grows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPayload {
    /// Tier that produced or accepted the work.
    pub executed_tier: Option<Tier>,
    /// Cost units consumed so far.
    pub cost_units: Option<u64>,
    /// Result artifact reference.
    pub result_ref: Option<String>,
    /// Inline outputs.
    pub outputs: Option<Value>,
    /// Error detail.
    pub error_detail: Option<String>,
    /// Full per-tier attempt trail (replaces the stored trail).
    pub attempts: Option<Vec<TierAttempt>>,
}

impl StatusPayload {
    /// Record the tier that did the work.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.executed_tier = Some(tier);
        self
    }

    /// Record cost units.
    pub fn with_cost(mut self, cost_units: u64) -> Self {
        self.cost_units = Some(cost_units);
        self
    }

    /// Record a result reference.
    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    /// Record inline outputs.
    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Record an error detail.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_detail = Some(error.into());
        self
    }

    /// Record the attempt trail.
    pub fn with_attempts(mut self, attempts: Vec<TierAttempt>) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// Result of a compare-and-swap status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The update was written; carries the updated record.
    Applied(Job),
    /// The job is already terminal; nothing was written.
    AlreadyTerminal(JobStatus),
    /// The job is not in the expected status; nothing was written.
    Conflict {
        /// Status the job is actually in.
        actual: JobStatus,
    },
}

impl Transition {
    /// Whether the update was written.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job moved to `cancelled`.
    Cancelled {
        /// Status the job was cancelled from.
        previous: JobStatus,
        /// Updated record.
        job: Job,
    },
    /// The job had already finished; nothing was written.
    AlreadyTerminal(JobStatus),
}

/// Filter for [`JobStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by tenant.
    pub tenant_id: Option<String>,
    /// Filter by process.
    pub process_id: Option<String>,
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by submitted_at >= value.
    pub submitted_after: Option<DateTime<Utc>>,
    /// Filter by submitted_at < value.
    pub submitted_before: Option<DateTime<Utc>>,
}

/// Page window for [`JobStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Maximum rows to return.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct JobPage {
    /// Jobs on this page, newest first.
    pub jobs: Vec<Job>,
    /// Total matching jobs across all pages.
    pub total_count: i64,
}

/// Job store interface used by the control plane.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Sync jobs start `running`, async jobs `queued`.
    async fn create(&self, job: &NewJob) -> Result<Job>;

    /// Fetch a job by id.
    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Move a job from `expected` to `next`, writing `payload` in the same statement.
    ///
    /// Terminal jobs report [`Transition::AlreadyTerminal`] and are never written.
    /// A job that is not in `expected` reports [`Transition::Conflict`]. An edge
    /// that does not exist in the state machine is a [`CoreError::InvalidTransition`].
    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        payload: &StatusPayload,
    ) -> Result<Transition>;

    /// List jobs matching `filter`, newest first.
    async fn query(&self, filter: &JobFilter, page: &Pagination) -> Result<JobPage>;

    /// Claim up to `limit` async jobs for a worker.
    ///
    /// Claims `queued` async jobs (moving them to `running`) and `running` async
    /// jobs that have no executed tier and whose lease has lapsed. Each claim is
    /// a compare-and-swap; a job is handed to at most one caller per lease.
    async fn claim_async(&self, limit: i64, lease: Duration) -> Result<Vec<Job>>;

    /// Hand a running job that has not produced a result to the async path.
    ///
    /// Flips the mode to async and clears the lease so the next claim picks it up.
    /// Returns false if the job is no longer eligible (finished, or a tier already
    /// accepted it).
    async fn requeue_async(&self, job_id: &str, attempts: &[TierAttempt]) -> Result<bool>;

    /// Record that `tier` accepted a `running` job for external execution.
    ///
    /// Sets the executed tier, stores the attempt trail and drops the lease, so
    /// the job is never claimed again and only a completion can finish it.
    /// Returns `None` if the job is no longer running.
    async fn mark_submitted(
        &self,
        job_id: &str,
        tier: Tier,
        attempts: &[TierAttempt],
    ) -> Result<Option<Job>>;

    /// Push the lease of a claimed async job out to `now + lease`.
    ///
    /// Only a job that is still leased (`running`, async, no executed tier) is
    /// renewed. Returns false once the job has left that state, e.g. after
    /// completion, cancellation or [`mark_submitted`](Self::mark_submitted).
    async fn heartbeat_lease(&self, job_id: &str, lease: Duration) -> Result<bool>;

    /// Persist the attempt trail of a `running` job without changing its status.
    ///
    /// Written before a tier call whose result may arrive out of band, so the
    /// trail survives a completion that lands before the call returns.
    async fn record_attempts(&self, job_id: &str, attempts: &[TierAttempt]) -> Result<bool>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool>;

    /// Fetch a job, failing with `JobNotFound` if it does not exist.
    async fn get_required(&self, job_id: &str) -> Result<Job> {
        self.get(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Cancel a `queued` or `running` job.
    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        loop {
            let job = self.get_required(job_id).await?;
            if job.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(job.status));
            }

            let payload = StatusPayload::default().with_error("cancelled by request");
            match self
                .update_status(job_id, job.status, JobStatus::Cancelled, &payload)
                .await?
            {
                Transition::Applied(updated) => {
                    return Ok(CancelOutcome::Cancelled {
                        previous: job.status,
                        job: updated,
                    });
                }
                Transition::AlreadyTerminal(status) => {
                    return Ok(CancelOutcome::AlreadyTerminal(status));
                }
                // Status moved forward underneath us; re-read and retry.
                Transition::Conflict { .. } => continue,
            }
        }
    }
}

/// Row shape shared by both SQL backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub job_id: String,
    pub process_id: String,
    pub tenant_id: String,
    pub parameters: String,
    pub dataset_ref: Option<String>,
    pub resource_class: String,
    pub mode: String,
    pub status: String,
    pub executed_tier: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost_units: i64,
    pub result_ref: Option<String>,
    pub outputs: Option<String>,
    pub error_detail: Option<String>,
    pub attempts: String,
    pub trace_id: String,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

pub(crate) const JOB_COLUMNS: &str = "job_id, process_id, tenant_id, parameters, dataset_ref, \
     resource_class, mode, status, executed_tier, submitted_at, started_at, completed_at, \
     cost_units, result_ref, outputs, error_detail, attempts, trace_id, lease_expires_at";

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let corrupt = |column: &str, details: String| CoreError::CorruptRecord {
            job_id: row.job_id.clone(),
            details: format!("{}: {}", column, details),
        };

        let parameters: Value = serde_json::from_str(&row.parameters)
            .map_err(|e| corrupt("parameters", e.to_string()))?;
        let resource_class: ResourceClass = row
            .resource_class
            .parse()
            .map_err(|e| corrupt("resource_class", e))?;
        let mode: ExecutionMode = row.mode.parse().map_err(|e| corrupt("mode", e))?;
        let status: JobStatus = row.status.parse().map_err(|e| corrupt("status", e))?;
        let executed_tier = row
            .executed_tier
            .as_deref()
            .map(str::parse::<Tier>)
            .transpose()
            .map_err(|e| corrupt("executed_tier", e))?;
        let outputs = row
            .outputs
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| corrupt("outputs", e.to_string()))?;
        let attempts: Vec<TierAttempt> = serde_json::from_str(&row.attempts)
            .map_err(|e| corrupt("attempts", e.to_string()))?;
        let cost_units =
            u64::try_from(row.cost_units).map_err(|e| corrupt("cost_units", e.to_string()))?;

        Ok(Job {
            job_id: row.job_id,
            process_id: row.process_id,
            tenant_id: row.tenant_id,
            parameters,
            dataset_ref: row.dataset_ref,
            resource_class,
            mode,
            status,
            executed_tier,
            submitted_at: row.submitted_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            cost_units,
            result_ref: row.result_ref,
            outputs,
            error_detail: row.error_detail,
            attempts,
            trace_id: row.trace_id,
            lease_expires_at: row.lease_expires_at,
        })
    }
}

/// Payload values encoded for binding.
pub(crate) struct EncodedPayload {
    pub executed_tier: Option<&'static str>,
    pub cost_units: Option<i64>,
    pub result_ref: Option<String>,
    pub outputs: Option<String>,
    pub error_detail: Option<String>,
    pub attempts: Option<String>,
}

impl EncodedPayload {
    pub fn encode(payload: &StatusPayload) -> Result<Self> {
        let cost_units = payload
            .cost_units
            .map(|c| {
                i64::try_from(c).map_err(|_| CoreError::ValidationError {
                    field: "cost_units".to_string(),
                    message: "exceeds storable range".to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            executed_tier: payload.executed_tier.map(|t| t.as_str()),
            cost_units,
            result_ref: payload.result_ref.clone(),
            outputs: payload
                .outputs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            error_detail: payload.error_detail.clone(),
            attempts: payload
                .attempts
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }
}

/// Validate the identifying fields of a new job.
pub(crate) fn validate_new_job(job: &NewJob) -> Result<()> {
    for (field, value) in [
        ("job_id", &job.job_id),
        ("process_id", &job.process_id),
        ("tenant_id", &job.tenant_id),
    ] {
        if value.trim().is_empty() {
            return Err(CoreError::ValidationError {
                field: field.to_string(),
                message: "must not be empty".to_string(),
            });
        }
    }
    Ok(())
}

/// Classify an update that was not written.
///
/// `current` is the record re-read after the compare-and-swap missed.
pub(crate) fn missed_transition(job_id: &str, current: Option<Job>) -> Result<Transition> {
    match current {
        None => Err(CoreError::JobNotFound {
            job_id: job_id.to_string(),
        }),
        Some(job) if job.status.is_terminal() => Ok(Transition::AlreadyTerminal(job.status)),
        Some(job) => Ok(Transition::Conflict { actual: job.status }),
    }
}

/// Classify a request for an edge that is not in the state machine.
pub(crate) fn invalid_transition(
    job_id: &str,
    current: Option<Job>,
    expected: JobStatus,
    next: JobStatus,
) -> Result<Transition> {
    match current {
        None => Err(CoreError::JobNotFound {
            job_id: job_id.to_string(),
        }),
        Some(job) if job.status.is_terminal() => Ok(Transition::AlreadyTerminal(job.status)),
        Some(_) => Err(CoreError::InvalidTransition {
            job_id: job_id.to_string(),
            from: expected,
            to: next,
        }),
    }
}

/// Map an insert failure, turning a primary-key clash into `JobAlreadyExists`.
pub(crate) fn map_insert_error(job_id: &str, err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return CoreError::JobAlreadyExists {
            job_id: job_id.to_string(),
        };
    }
    CoreError::database("insert_job", err)
}

pub(crate) fn lease_deadline(lease: Duration) -> Result<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease).map_err(|e| CoreError::ValidationError {
        field: "lease".to_string(),
        message: e.to_string(),
    })?;
    Ok(Utc::now() + lease)
}
