// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor for testing.
//!
//! Simulates a tier with a scripted behavior and records every call, so tests
//! can assert which tiers were tried and how often.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use geoplane_core::Tier;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::*;

/// Scripted outcome of a mock call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Complete with the request parameters echoed as outputs.
    Succeed {
        /// Cost reported back.
        cost_units: u64,
    },
    /// Report capacity rejection.
    RejectCapacity,
    /// Fail fatally with the given detail.
    Fail(String),
    /// Never finish until cancelled.
    Hang,
    /// Accept for external execution.
    Submit,
}

/// Mock tier executor.
pub struct MockExecutor {
    tier: Tier,
    behavior: MockBehavior,
    /// Simulated work time before the behavior applies.
    pub delay: Duration,
    target_latency: Duration,
    calls: AtomicUsize,
    cancelled: AtomicUsize,
    seen_jobs: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    /// Create a mock for `tier` with the given behavior.
    pub fn new(tier: Tier, behavior: MockBehavior) -> Self {
        Self {
            tier,
            behavior,
            delay: Duration::ZERO,
            target_latency: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            seen_jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A mock that always succeeds with cost 1.
    pub fn succeeding(tier: Tier) -> Self {
        Self::new(tier, MockBehavior::Succeed { cost_units: 1 })
    }

    /// A mock that always rejects for capacity.
    pub fn rejecting(tier: Tier) -> Self {
        Self::new(tier, MockBehavior::RejectCapacity)
    }

    /// A mock that always fails fatally.
    pub fn failing(tier: Tier) -> Self {
        Self::new(tier, MockBehavior::Fail("mock failure".to_string()))
    }

    /// A mock whose calls never complete on their own.
    /// Useful for testing synchronous deadlines.
    pub fn hanging(tier: Tier) -> Self {
        Self::new(tier, MockBehavior::Hang)
    }

    /// A mock that hands work off for external completion.
    pub fn submitting(tier: Tier) -> Self {
        Self::new(tier, MockBehavior::Submit)
    }

    /// Set the simulated work time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the reported target latency.
    pub fn with_target_latency(mut self, target_latency: Duration) -> Self {
        self.target_latency = target_latency;
        self
    }

    /// Number of `execute` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that ended by observing cancellation.
    pub fn cancellations(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Job ids in the order they were executed.
    pub async fn seen_jobs(&self) -> Vec<String> {
        self.seen_jobs.lock().await.clone()
    }

    async fn cancelled(&self) -> Result<TierOutput> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Err(TierError::Cancelled)
    }
}

#[async_trait]
impl TierExecutor for MockExecutor {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn target_latency(&self) -> Duration {
        self.target_latency
    }

    fn completes_out_of_band(&self) -> bool {
        self.behavior == MockBehavior::Submit
    }

    async fn execute(&self, request: &TierRequest, cancel: CancellationToken) -> Result<TierOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_jobs.lock().await.push(request.job_id.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return self.cancelled().await,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        match &self.behavior {
            MockBehavior::Succeed { cost_units } => Ok(TierOutput::Completed {
                result_ref: Some(format!("mock://{}/{}", self.tier, request.job_id)),
                outputs: Some(json!({ "echo": request.parameters.clone() })),
                cost_units: *cost_units,
            }),
            MockBehavior::RejectCapacity => Err(TierError::CapacityRejected(format!(
                "mock {} is full",
                self.tier
            ))),
            MockBehavior::Fail(detail) => Err(TierError::ExecutionFailed(detail.clone())),
            MockBehavior::Hang => {
                cancel.cancelled().await;
                self.cancelled().await
            }
            MockBehavior::Submit => Ok(TierOutput::Submitted {
                external_ref: format!("mock-batch-{}", request.job_id),
            }),
        }
    }
}
