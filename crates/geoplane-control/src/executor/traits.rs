// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tier executor trait definitions.
//!
//! Defines the abstract interface every execution tier implements.

use std::time::Duration;

use async_trait::async_trait;
use geoplane_core::{Job, ResourceClass, Tier};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Signals a tier can raise instead of a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TierError {
    /// The tier has no free capacity right now. The coordinator tries the next tier.
    #[error("capacity rejected: {0}")]
    CapacityRejected(String),

    /// The tier failed fatally. The job fails without fallback.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The call observed its cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// Result type for tier executor operations.
pub type Result<T> = std::result::Result<T, TierError>;

/// Everything a tier needs to run one job.
#[derive(Debug, Clone)]
pub struct TierRequest {
    /// Job being executed.
    pub job_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Process being executed.
    pub process_id: String,
    /// Handler bound to the process on this tier.
    pub handler: String,
    /// Process parameters.
    pub parameters: Value,
    /// Referenced dataset.
    pub dataset_ref: Option<String>,
    /// Admitted resource class.
    pub resource_class: ResourceClass,
    /// Longest the job may run under its class.
    pub max_duration: Duration,
    /// Tenant cost cap, if any.
    pub cost_cap: Option<u64>,
    /// Trace correlation id.
    pub trace_id: String,
}

impl TierRequest {
    /// Build a request for `job` using `handler`.
    pub fn for_job(job: &Job, handler: impl Into<String>, max_duration: Duration) -> Self {
        Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            process_id: job.process_id.clone(),
            handler: handler.into(),
            parameters: job.parameters.clone(),
            dataset_ref: job.dataset_ref.clone(),
            resource_class: job.resource_class,
            max_duration,
            cost_cap: None,
            trace_id: job.trace_id.clone(),
        }
    }

    /// Attach the tenant's cost cap.
    pub fn with_cost_cap(mut self, cost_cap: Option<u64>) -> Self {
        self.cost_cap = cost_cap;
        self
    }
}

/// What a tier returns on success.
#[derive(Debug, Clone, PartialEq)]
pub enum TierOutput {
    /// The tier finished the work.
    Completed {
        /// Reference to the staged result artifact.
        result_ref: Option<String>,
        /// Small inline outputs.
        outputs: Option<Value>,
        /// Cost units consumed.
        cost_units: u64,
    },
    /// The tier accepted the work for external execution; a completion
    /// notification will report the outcome.
    Submitted {
        /// External reference of the submission.
        external_ref: String,
    },
}

/// One execution tier.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    /// Tier this executor serves.
    fn tier(&self) -> Tier;

    /// Expected latency of a typical call, used for the synchronous deadline.
    fn target_latency(&self) -> Duration;

    /// Whether this tier reports results through completion messages.
    ///
    /// The coordinator persists the attempt trail before calling such a tier,
    /// since a completion can be reconciled before `execute` returns.
    fn completes_out_of_band(&self) -> bool {
        false
    }

    /// Execute one job.
    ///
    /// `cancel` is raised when the synchronous deadline elapses or the job is
    /// cancelled. Honoring it is best effort.
    async fn execute(&self, request: &TierRequest, cancel: CancellationToken)
    -> Result<TierOutput>;
}
