// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for geoplane-core.
//!
//! Every store operation returns [`CoreError`]. Each variant has a stable
//! machine-readable code so protocol adapters can map it without string matching.

use std::fmt;

use crate::job::JobStatus;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the job store and the job model.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Job was not found in the store.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// A job with this ID already exists.
    JobAlreadyExists {
        /// The duplicated job ID.
        job_id: String,
    },

    /// The requested status change is not an edge of the state machine.
    InvalidTransition {
        /// The job ID.
        job_id: String,
        /// Status the caller expected the job to be in.
        from: JobStatus,
        /// Status the caller asked for.
        to: JobStatus,
    },

    /// A persisted value could not be decoded into the job model.
    CorruptRecord {
        /// The job ID.
        job_id: String,
        /// Which column was unreadable and why.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::JobAlreadyExists { .. } => "JOB_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Build a `DatabaseError` tagged with the failing operation.
    pub fn database(operation: &str, err: impl fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobNotFound { job_id } => write!(f, "Job '{}' not found", job_id),
            Self::JobAlreadyExists { job_id } => write!(f, "Job '{}' already exists", job_id),
            Self::InvalidTransition { job_id, from, to } => write!(
                f,
                "Job '{}' cannot move from '{}' to '{}'",
                job_id, from, to
            ),
            Self::CorruptRecord { job_id, details } => {
                write!(f, "Job '{}' has an unreadable record: {}", job_id, details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::database("query", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::database("json", err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::database("migrate", err)
    }
}
