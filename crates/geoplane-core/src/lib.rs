// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geoplane Core - job model and job store
//!
//! This crate owns the durable half of the geoplane control plane: the job
//! aggregate, its state machine, resource classes, and the job store that is
//! the single writer of job status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      geoplane-control                        │
//! │   admission ─▶ selector ─▶ coordinator ─▶ tier executors     │
//! │        completion listener / async worker                    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ propose transitions (CAS)
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  geoplane-core (this crate)                  │
//! │        JobStore: SqliteJobStore | PostgresJobStore           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! | Status | Meaning | Next |
//! |--------|---------|------|
//! | `queued` | Accepted, waiting for an async worker | `running`, `failed`, `cancelled` |
//! | `running` | A tier attempt or batch submission is in flight | `succeeded`, `failed`, `cancelled` |
//! | `succeeded` | Finished with a result reference | terminal |
//! | `failed` | Finished with an error | terminal |
//! | `cancelled` | Cancelled by the caller | terminal |
//!
//! Every write is a compare-and-swap on the current status. Writes against a
//! terminal job are reported as [`store::Transition::AlreadyTerminal`] and
//! leave the record untouched, so duplicate completions and late cancels
//! are harmless.

#![deny(missing_docs)]

pub mod error;
pub mod job;
pub mod migrations;
pub mod resource;
pub mod store;

pub use error::{CoreError, Result};
pub use job::{AttemptOutcome, ExecutionMode, Job, JobStatus, NewJob, Tier, TierAttempt};
pub use resource::{QuotaLimits, ResourceClass};
pub use store::{
    CancelOutcome, JobFilter, JobPage, JobStore, Pagination, PostgresJobStore, SqliteJobStore,
    StatusPayload, Transition,
};
