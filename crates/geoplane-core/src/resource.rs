// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource classes and the quota semantics they carry.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Named bucket of quota semantics assigned to a job at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Short CPU-bound work on the fast path.
    BurstCpu,
    /// Database-bound work; also consumes connection budget.
    DbHeavy,
    /// Accelerator-backed batch work.
    BatchGpu,
    /// Long-running background work.
    LongTail,
}

impl ResourceClass {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BurstCpu => "burst_cpu",
            Self::DbHeavy => "db_heavy",
            Self::BatchGpu => "batch_gpu",
            Self::LongTail => "long_tail",
        }
    }

    /// Whether jobs of this class hold database connections.
    pub fn is_database_bound(&self) -> bool {
        matches!(self, Self::DbHeavy)
    }

    /// Limits applied when no tenant-specific limits are configured.
    pub fn default_limits(&self) -> QuotaLimits {
        match self {
            Self::BurstCpu => QuotaLimits {
                max_concurrency: 64,
                max_duration: Duration::from_secs(30),
                max_connections: None,
                cpu_seconds_per_window: 600,
            },
            Self::DbHeavy => QuotaLimits {
                max_concurrency: 16,
                max_duration: Duration::from_secs(300),
                max_connections: Some(8),
                cpu_seconds_per_window: 1_200,
            },
            Self::BatchGpu => QuotaLimits {
                max_concurrency: 4,
                max_duration: Duration::from_secs(3_600),
                max_connections: None,
                cpu_seconds_per_window: 14_400,
            },
            Self::LongTail => QuotaLimits {
                max_concurrency: 8,
                max_duration: Duration::from_secs(6 * 3_600),
                max_connections: None,
                cpu_seconds_per_window: 28_800,
            },
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "burst_cpu" => Ok(Self::BurstCpu),
            "db_heavy" => Ok(Self::DbHeavy),
            "batch_gpu" => Ok(Self::BatchGpu),
            "long_tail" => Ok(Self::LongTail),
            other => Err(format!("unknown resource class '{}'", other)),
        }
    }
}

/// Per-tenant limits for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Jobs that may hold a reservation at the same time.
    pub max_concurrency: u32,
    /// Longest a single job of this class may run.
    #[serde(with = "duration_secs")]
    pub max_duration: Duration,
    /// Database connections that may be held at once (database-bound classes only).
    pub max_connections: Option<u32>,
    /// CPU-seconds that may be reserved within one accounting window.
    pub cpu_seconds_per_window: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
