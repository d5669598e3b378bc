// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion listener.
//!
//! Consumes completion notifications from the batch tier over an
//! at-least-once channel and reconciles them into the job store.
//!
//! - The first terminal write wins. Messages for a job that is already
//!   terminal are acknowledged and dropped without a write.
//! - Malformed messages, unknown job ids and jobs that are not `running` are
//!   dead-lettered and acknowledged. They never stop the consumer loop.
//! - Store failures negatively acknowledge the delivery. Redelivery is up
//!   to the source.
//!
//! Messages are processed concurrently up to a fixed bound. Each
//! reconciliation is a single compare-and-swap, so two deliveries for the
//! same job cannot both apply.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geoplane_core::{
    AttemptOutcome, CoreError, Job, JobStatus, JobStore, StatusPayload, Tier, Transition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;

/// Terminal status reported by a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The batch run produced a result.
    Succeeded,
    /// The batch run failed.
    Failed,
}

/// A completion notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// Job the notification is about.
    pub job_id: String,
    /// Reported outcome.
    pub status: CompletionStatus,
    /// Reference to the staged result artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    /// Small inline outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Error reported by a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cost units consumed by the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_units: Option<u64>,
    /// Tier that ran the job, when the sender knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl CompletionMessage {
    /// Successful completion.
    pub fn succeeded(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: CompletionStatus::Succeeded,
            result_ref: None,
            outputs: None,
            error: None,
            cost_units: None,
            tier: None,
        }
    }

    /// Failed completion.
    pub fn failed(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            status: CompletionStatus::Failed,
            ..Self::succeeded(job_id)
        }
    }

    /// Attach a result reference.
    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    /// Attach inline outputs.
    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Attach consumed cost.
    pub fn with_cost(mut self, cost_units: u64) -> Self {
        self.cost_units = Some(cost_units);
        self
    }

    /// Name the tier that ran the job.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Parse a JSON payload.
    pub fn parse(payload: &str) -> Result<Self, CompletionError> {
        let message: Self = serde_json::from_str(payload)
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        if message.job_id.trim().is_empty() {
            return Err(CompletionError::Malformed("job_id is empty".to_string()));
        }
        Ok(message)
    }

    /// Wrap into a delivery with a fresh delivery id.
    pub fn to_delivery(&self) -> Delivery {
        // Serializing a struct of strings and JSON values cannot fail.
        let payload = serde_json::to_string(self).unwrap_or_default();
        Delivery::new(payload)
    }
}

/// Why a completion message could not be applied.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompletionError {
    /// Payload is not a valid completion message.
    #[error("malformed completion message: {0}")]
    Malformed(String),

    /// No job with this id exists.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The job is neither running nor terminal.
    #[error("job '{job_id}' is {status}, not running")]
    NotRunning {
        /// The job.
        job_id: String,
        /// Its status.
        status: JobStatus,
    },

    /// The job store failed.
    #[error("store error: {0}")]
    Store(#[from] CoreError),
}

impl CompletionError {
    /// Whether the delivery belongs in the dead-letter sink.
    pub fn is_dead_letter(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Result of reconciling one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The terminal status was written.
    Applied(Job),
    /// The job was already terminal; nothing was written.
    Duplicate(JobStatus),
}

/// Apply one completion message to the store.
///
/// Shared by the listener and by direct `record_completion` /
/// `record_failure` calls. The reservation is released only when this call's
/// write applied.
pub async fn reconcile(
    store: &dyn JobStore,
    admission: &AdmissionController,
    message: &CompletionMessage,
) -> Result<Reconciled, CompletionError> {
    let job = store
        .get(&message.job_id)
        .await?
        .ok_or_else(|| CompletionError::UnknownJob(message.job_id.clone()))?;

    if job.status.is_terminal() {
        info!(job_id = %job.job_id, status = %job.status, "Completion for terminal job dropped");
        return Ok(Reconciled::Duplicate(job.status));
    }
    if job.status != JobStatus::Running {
        return Err(CompletionError::NotRunning {
            job_id: job.job_id,
            status: job.status,
        });
    }

    let mut payload = StatusPayload {
        cost_units: message.cost_units,
        executed_tier: completing_tier(&job, message),
        ..StatusPayload::default()
    };
    let next = match message.status {
        CompletionStatus::Succeeded => {
            payload.result_ref = message.result_ref.clone();
            payload.outputs = message.outputs.clone();
            JobStatus::Succeeded
        }
        CompletionStatus::Failed => {
            payload.error_detail = Some(
                message
                    .error
                    .clone()
                    .unwrap_or_else(|| "batch execution failed".to_string()),
            );
            JobStatus::Failed
        }
    };

    match store
        .update_status(&job.job_id, JobStatus::Running, next, &payload)
        .await?
    {
        Transition::Applied(updated) => {
            info!(job_id = %updated.job_id, status = %updated.status, "Completion applied");
            admission.release(&updated.job_id).await;
            Ok(Reconciled::Applied(updated))
        }
        Transition::AlreadyTerminal(status) => {
            info!(job_id = %job.job_id, status = %status, "Completion lost the race to another terminal write");
            Ok(Reconciled::Duplicate(status))
        }
        Transition::Conflict { actual } => Err(CompletionError::NotRunning {
            job_id: job.job_id,
            status: actual,
        }),
    }
}

/// Tier to record for a job whose completion arrives before submission was
/// recorded: the message's own tier, else the tier last dispatched to.
fn completing_tier(job: &Job, message: &CompletionMessage) -> Option<Tier> {
    if job.executed_tier.is_some() {
        return None;
    }
    message.tier.or_else(|| {
        job.attempts
            .iter()
            .rev()
            .find(|a| a.outcome == AttemptOutcome::Dispatched)
            .map(|a| a.tier)
    })
}

/// One message received from the completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-assigned id used for acknowledgement.
    pub delivery_id: String,
    /// Raw JSON payload.
    pub payload: String,
}

impl Delivery {
    /// Delivery with a generated id.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
        }
    }
}

/// At-least-once source of completion deliveries.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Next delivery, or `None` once the channel is closed.
    async fn receive(&self) -> Option<Delivery>;

    /// Acknowledge a delivery so it is not redelivered.
    async fn ack(&self, delivery_id: &str);

    /// Return a delivery that could not be processed.
    ///
    /// The source owns redelivery. A broker-backed source typically drops its
    /// claim and lets the broker hand the message out again.
    async fn nack(&self, delivery: Delivery);
}

/// Destination for messages that cannot be applied.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Park `delivery` with the reason it was rejected.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str);
}

/// Default wait before a negatively acknowledged delivery is re-queued.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// In-process completion channel backed by a tokio mpsc queue.
///
/// Negatively acknowledged deliveries are put back on the queue after a
/// delay. The source holds only a weak sender, so the channel still closes
/// once every external sender is dropped.
pub struct ChannelCompletionSource {
    receiver: Mutex<mpsc::Receiver<Delivery>>,
    requeue: mpsc::WeakSender<Delivery>,
    redelivery_delay: Duration,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
}

impl ChannelCompletionSource {
    /// Create a source and the sender that feeds it.
    pub fn new(buffer: usize) -> (mpsc::Sender<Delivery>, Self) {
        let (sender, receiver) = mpsc::channel(buffer);
        let requeue = sender.downgrade();
        (
            sender,
            Self {
                receiver: Mutex::new(receiver),
                requeue,
                redelivery_delay: DEFAULT_REDELIVERY_DELAY,
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
            },
        )
    }

    /// Set how long a negatively acknowledged delivery waits before redelivery.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Delivery ids acknowledged so far, in acknowledgement order.
    pub async fn acked(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    /// Delivery ids negatively acknowledged so far.
    pub async fn nacked(&self) -> Vec<String> {
        self.nacked.lock().await.clone()
    }
}

#[async_trait]
impl CompletionSource for ChannelCompletionSource {
    async fn receive(&self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }

    async fn ack(&self, delivery_id: &str) {
        self.acked.lock().await.push(delivery_id.to_string());
    }

    async fn nack(&self, delivery: Delivery) {
        self.nacked.lock().await.push(delivery.delivery_id.clone());

        let requeue = self.requeue.clone();
        let delay = self.redelivery_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(sender) = requeue.upgrade() else {
                warn!(delivery_id = %delivery.delivery_id, "Completion channel closed, delivery dropped");
                return;
            };
            let delivery_id = delivery.delivery_id.clone();
            if sender.send(delivery).await.is_err() {
                warn!(delivery_id = %delivery_id, "Completion channel closed, delivery dropped");
            } else {
                debug!(delivery_id = %delivery_id, "Completion redelivered");
            }
        });
    }
}

/// Dead-letter sink that keeps entries in memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    entries: Mutex<VecDeque<(Delivery, String)>>,
}

impl MemoryDeadLetterSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked deliveries with their reasons, oldest first.
    pub async fn entries(&self) -> Vec<(Delivery, String)> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        self.entries
            .lock()
            .await
            .push_back((delivery.clone(), reason.to_string()));
    }
}

/// Long-running consumer of the completion channel.
pub struct CompletionListener {
    source: Arc<dyn CompletionSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    store: Arc<dyn JobStore>,
    admission: Arc<AdmissionController>,
    concurrency: usize,
    shutdown: Arc<Notify>,
}

impl CompletionListener {
    /// Create a listener processing up to `concurrency` messages at once.
    pub fn new(
        source: Arc<dyn CompletionSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        store: Arc<dyn JobStore>,
        admission: Arc<AdmissionController>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            dead_letters,
            store,
            admission,
            concurrency: concurrency.max(1),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the consumer loop until shutdown or until the source closes.
    ///
    /// In-flight messages are finished before returning.
    pub async fn run(self) {
        info!(concurrency = self.concurrency, "Completion listener started");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Completion task panicked");
                }
            }

            let delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Completion listener shutting down");
                    break;
                }
                delivery = self.source.receive() => delivery,
            };
            let Some(delivery) = delivery else {
                info!("Completion source closed");
                break;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let source = self.source.clone();
            let dead_letters = self.dead_letters.clone();
            let store = self.store.clone();
            let admission = self.admission.clone();
            tasks.spawn(async move {
                handle_delivery(
                    source.as_ref(),
                    dead_letters.as_ref(),
                    store.as_ref(),
                    &admission,
                    delivery,
                )
                .await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Completion task panicked");
            }
        }
        info!("Completion listener stopped");
    }
}

async fn handle_delivery(
    source: &dyn CompletionSource,
    dead_letters: &dyn DeadLetterSink,
    store: &dyn JobStore,
    admission: &AdmissionController,
    delivery: Delivery,
) {
    let result = match CompletionMessage::parse(&delivery.payload) {
        Ok(message) => reconcile(store, admission, &message).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(Reconciled::Applied(_)) => source.ack(&delivery.delivery_id).await,
        Ok(Reconciled::Duplicate(status)) => {
            debug!(delivery_id = %delivery.delivery_id, status = %status, "Duplicate completion acknowledged");
            source.ack(&delivery.delivery_id).await;
        }
        Err(e) if e.is_dead_letter() => {
            warn!(delivery_id = %delivery.delivery_id, reason = %e, "Completion dead-lettered");
            dead_letters.dead_letter(&delivery, &e.to_string()).await;
            source.ack(&delivery.delivery_id).await;
        }
        Err(e) => {
            error!(
                delivery_id = %delivery.delivery_id,
                error = %e,
                "Failed to reconcile completion, returning it for redelivery"
            );
            source.nack(delivery).await;
        }
    }
}
