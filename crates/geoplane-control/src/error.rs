// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for geoplane-control.
//!
//! [`Error`] is what protocol adapters see. Capacity rejection, synchronous
//! timeouts and malformed completion messages are handled inside the control
//! plane and never appear here.

use std::time::Duration;

use geoplane_core::{CoreError, JobStatus, Tier};
use thiserror::Error;

use crate::policy::PolicyError;
use crate::registry::RegistryError;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Quota or policy gate refused the request.
    #[error("Admission rejected: {reason}")]
    AdmissionRejected {
        /// Which limit was hit.
        reason: String,
        /// When the caller may retry. `None` means retrying will not help.
        retry_after: Option<Duration>,
    },

    /// No candidate tier survived selection.
    #[error("No compatible tier for process '{process_id}': {}", .reasons.join("; "))]
    NoCompatibleTier {
        /// The requested process.
        process_id: String,
        /// Why each candidate was removed, in candidate order.
        reasons: Vec<String>,
    },

    /// The job failed while executing; it is recorded as `failed`.
    #[error("Job '{job_id}' failed: {detail}")]
    ExecutionFailed {
        /// The failed job.
        job_id: String,
        /// Tier that failed, or `None` when every tier rejected for capacity.
        tier: Option<Tier>,
        /// Error detail as recorded on the job.
        detail: String,
    },

    /// Process id is not registered.
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    /// Request parameters do not match the process definition.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Job id is unknown.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is not in a status that accepts the request.
    #[error("Job '{job_id}' is {status}")]
    InvalidState {
        /// The job.
        job_id: String,
        /// Its current status.
        status: JobStatus,
    },

    /// Job store failure.
    #[error("Store error: {0}")]
    Store(CoreError),

    /// Tenant policy lookup failed.
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Process registry failure.
    #[error("Registry error: {0}")]
    Registry(RegistryError),
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AdmissionRejected { retry_after, .. } => retry_after.is_some(),
            Self::Store(CoreError::DatabaseError { .. }) | Self::Policy(_) => true,
            _ => false,
        }
    }

    /// Suggested wait before retrying, for admission rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AdmissionRejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::JobNotFound { job_id } => Self::JobNotFound(job_id),
            other => Self::Store(other),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(process_id) => Self::ProcessNotFound(process_id),
            other => Self::Registry(other),
        }
    }
}

/// Result type using the control plane [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
