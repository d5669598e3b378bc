// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geoplane Control - geoprocessing control plane
//!
//! Accepts requests to run spatial processes and routes each one to an
//! execution tier: the in-process fast path, database-native execution, or
//! externally managed batch execution.
//!
//! # Architecture
//!
//! ```text
//!  request
//!     │
//!     ▼
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │ registry │──▶│ admission │──▶│ selector │──▶│ coordinator │──▶│ tier executor│
//! └──────────┘   └───────────┘   └──────────┘   └──────┬──────┘   └──────────────┘
//!                  quotas per      locality            │ CAS            │ completion
//!                  tenant/class    filtering           ▼                ▼ messages
//!                                              ┌─────────────┐   ┌──────────────┐
//!                                              │  job store  │◀──│   listener   │
//!                                              └─────────────┘   └──────────────┘
//!                                                     ▲
//!                                                     │ claim (lease)
//!                                              ┌─────────────┐
//!                                              │ async worker│
//!                                              └─────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `submit` | Admit, select tiers, then execute inline or enqueue |
//! | `get_job_status` | Current job record |
//! | `cancel_job` | Cancel a queued or running job |
//! | `record_completion` | Apply an external success |
//! | `record_failure` | Apply an external failure |
//! | `query_jobs` | Filter and page through jobs |
//! | `list_processes` / `describe_process` | Process catalog |
//!
//! # Fallback
//!
//! Only a tier's capacity rejection moves a job to the next candidate tier.
//! A fatal tier error fails the job. A synchronous call that misses its
//! deadline is cancelled and the job continues on the async path.

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod control_plane;
pub mod coordinator;
pub mod datasource;
pub mod error;
pub mod executor;
pub mod listener;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod worker;

pub use control_plane::{ControlPlane, SubmitOutcome, SubmitRequest};
pub use error::{Error, Result};
pub use runtime::ControlPlaneRuntime;
