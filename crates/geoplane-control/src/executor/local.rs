// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process fast-path executor.
//!
//! Runs registered [`ProcessHandler`]s inside the control plane process. A
//! fixed number of slots bounds concurrent work; when every slot is taken the
//! executor reports capacity rejection immediately instead of queueing, so the
//! coordinator can move on to the next tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geoplane_core::Tier;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::*;

/// Output of an in-process handler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerOutput {
    /// Small inline outputs.
    pub outputs: Option<Value>,
    /// Reference to a staged artifact, for outputs too large to inline.
    pub result_ref: Option<String>,
    /// Cost units consumed.
    pub cost_units: u64,
}

/// A process implementation runnable on the fast path.
#[async_trait]
pub trait ProcessHandler: Send + Sync {
    /// Run with the job's parameters. Errors are fatal for the job.
    async fn run(
        &self,
        parameters: &Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<HandlerOutput, String>;
}

/// Returns its parameters as outputs. Useful for smoke tests and wiring checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl ProcessHandler for EchoHandler {
    async fn run(
        &self,
        parameters: &Value,
        _cancel: &CancellationToken,
    ) -> std::result::Result<HandlerOutput, String> {
        Ok(HandlerOutput {
            outputs: Some(parameters.clone()),
            result_ref: None,
            cost_units: 1,
        })
    }
}

/// Fast-path executor backed by in-process handlers.
pub struct LocalExecutor {
    handlers: HashMap<String, Arc<dyn ProcessHandler>>,
    slots: Arc<Semaphore>,
    target_latency: Duration,
}

impl LocalExecutor {
    /// Create an executor with `max_concurrency` slots and the `echo` handler registered.
    pub fn new(max_concurrency: usize) -> Self {
        let mut executor = Self {
            handlers: HashMap::new(),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            target_latency: Duration::from_secs(1),
        };
        executor.register("echo", Arc::new(EchoHandler));
        executor
    }

    /// Set the expected latency used for synchronous deadlines.
    pub fn with_target_latency(mut self, target_latency: Duration) -> Self {
        self.target_latency = target_latency;
        self
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ProcessHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Builder form of [`LocalExecutor::register`].
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn ProcessHandler>) -> Self {
        self.register(name, handler);
        self
    }

    /// Slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl TierExecutor for LocalExecutor {
    fn tier(&self) -> Tier {
        Tier::FastLocal
    }

    fn target_latency(&self) -> Duration {
        self.target_latency
    }

    async fn execute(&self, request: &TierRequest, cancel: CancellationToken) -> Result<TierOutput> {
        let Ok(_permit) = self.slots.clone().try_acquire_owned() else {
            return Err(TierError::CapacityRejected(
                "all local execution slots are busy".to_string(),
            ));
        };

        let handler = self.handlers.get(&request.handler).ok_or_else(|| {
            TierError::ExecutionFailed(format!(
                "no local handler registered as '{}'",
                request.handler
            ))
        })?;

        debug!(job_id = %request.job_id, handler = %request.handler, "Running local handler");

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(TierError::Cancelled),
            output = handler.run(&request.parameters, &cancel) => output,
        };

        let output = output.map_err(TierError::ExecutionFailed)?;
        Ok(TierOutput::Completed {
            result_ref: output.result_ref,
            outputs: output.outputs,
            cost_units: output.cost_units,
        })
    }
}
