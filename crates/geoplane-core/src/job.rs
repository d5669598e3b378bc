// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The job aggregate and its state machine.
//!
//! ```text
//!   ┌────────┐  claim/start   ┌─────────┐
//!   │ QUEUED │───────────────▶│ RUNNING │
//!   └───┬────┘                └────┬────┘
//!       │ cancel / fail            │
//!       │         ┌────────────────┼───────────────┐
//!       ▼         ▼                ▼               ▼
//!  ┌───────────┐ ┌────────┐  ┌───────────┐
//!  │ CANCELLED │ │ FAILED │  │ SUCCEEDED │
//!  └───────────┘ └────────┘  └───────────┘
//! ```
//!
//! A synchronous run is created directly in `RUNNING`. Terminal states
//! accept no further transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceClass;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and waiting for an async worker.
    Queued,
    /// A tier attempt is in progress (or a batch submission is outstanding).
    Running,
    /// Finished with a result.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Status name used by OGC API - Processes status documents.
    pub fn ogc_status(&self) -> &'static str {
        match self {
            Self::Queued => "accepted",
            Self::Running => "running",
            Self::Succeeded => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "dismissed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// How the caller wants the job executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Caller waits for the result (degrades to async on timeout).
    Sync,
    /// Caller gets a job id back immediately and polls.
    Async,
}

impl ExecutionMode {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

/// Execution backend a job can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// In-process fast path.
    FastLocal,
    /// Stored-procedure execution inside the spatial database.
    DbNative,
    /// Externally managed batch execution; completes asynchronously.
    CloudBatch,
}

impl Tier {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastLocal => "fast_local",
            Self::DbNative => "db_native",
            Self::CloudBatch => "cloud_batch",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast_local" => Ok(Self::FastLocal),
            "db_native" => Ok(Self::DbNative),
            "cloud_batch" => Ok(Self::CloudBatch),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// What happened when a tier was considered or attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Tier had no free capacity; the next candidate was tried.
    CapacityRejected,
    /// Tier failed fatally; no fallback.
    Failed,
    /// Synchronous deadline elapsed; the job was handed to the async path.
    TimedOut,
    /// The attempt was cancelled.
    Cancelled,
    /// Tier produced a result.
    Succeeded,
    /// Tier accepted a batch submission; completion arrives later.
    Submitted,
    /// Call to an out-of-band tier is in progress. Recorded before the call.
    Dispatched,
}

/// One entry of a job's per-tier diagnosis trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAttempt {
    /// Tier that was attempted.
    pub tier: Tier,
    /// Outcome of the attempt.
    pub outcome: AttemptOutcome,
    /// Human-readable reason reported by the tier.
    pub reason: String,
}

impl TierAttempt {
    /// Create an attempt record.
    pub fn new(tier: Tier, outcome: AttemptOutcome, reason: impl Into<String>) -> Self {
        Self {
            tier,
            outcome,
            reason: reason.into(),
        }
    }
}

/// A job record: one request to execute a process.
///
/// Identifying fields never change after creation. Status, timestamps,
/// results and cost are updated in place through the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Generated job identifier.
    pub job_id: String,
    /// Process this job executes.
    pub process_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Process parameters as submitted.
    pub parameters: Value,
    /// Dataset referenced by the request, used for data-locality decisions.
    pub dataset_ref: Option<String>,
    /// Quota bucket the job was admitted under.
    pub resource_class: ResourceClass,
    /// Sync or async execution.
    pub mode: ExecutionMode,
    /// Current status.
    pub status: JobStatus,
    /// Tier that produced (or accepted) the work. Write-once.
    pub executed_tier: Option<Tier>,
    /// When the job was created.
    pub submitted_at: DateTime<Utc>,
    /// When the job first entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cost units consumed. Never decreases.
    pub cost_units: u64,
    /// Reference to the result artifact (never the payload itself).
    pub result_ref: Option<String>,
    /// Small inline outputs reported by the tier.
    pub outputs: Option<Value>,
    /// Error detail for failed jobs.
    pub error_detail: Option<String>,
    /// Ordered per-tier rejection/failure reasons.
    pub attempts: Vec<TierAttempt>,
    /// Trace correlation id.
    pub trace_id: String,
    /// Visibility-timeout lease held by an async worker.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Wall-clock duration between start and completion, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Fields supplied when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job identifier (generate with [`NewJob::generate_id`]).
    pub job_id: String,
    /// Process to execute.
    pub process_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Process parameters.
    pub parameters: Value,
    /// Referenced dataset.
    pub dataset_ref: Option<String>,
    /// Admitted resource class.
    pub resource_class: ResourceClass,
    /// Execution mode. Sync jobs are created `running`, async jobs `queued`.
    pub mode: ExecutionMode,
    /// Trace correlation id.
    pub trace_id: String,
}

impl NewJob {
    /// Generate a fresh job identifier.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Status a job of this mode starts in.
    pub fn initial_status(&self) -> JobStatus {
        match self.mode {
            ExecutionMode::Sync => JobStatus::Running,
            ExecutionMode::Async => JobStatus::Queued,
        }
    }
}
