// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async worker.
//!
//! Periodically claims async jobs from the store and drives each one through
//! the coordinator on its own task. A claim carries a lease that the task
//! renews while the job runs; a worker that dies mid-job stops renewing, the
//! lease lapses and the job is claimed again.

use std::sync::Arc;
use std::time::Duration;

use geoplane_core::Job;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlane;
use crate::coordinator::CoordinatorOutcome;

/// Async worker configuration.
#[derive(Debug, Clone)]
pub struct AsyncWorkerConfig {
    /// How often to poll for claimable jobs
    pub poll_interval: Duration,
    /// Maximum jobs to claim per poll
    pub batch_size: i64,
    /// Lease placed on each claimed job
    pub visibility_timeout: Duration,
}

impl Default for AsyncWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl AsyncWorkerConfig {
    /// How often a running job's lease is renewed: a third of the lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(10))
    }
}

/// Async worker that runs as a background task.
pub struct AsyncWorker {
    plane: Arc<ControlPlane>,
    config: AsyncWorkerConfig,
    shutdown: Arc<Notify>,
}

impl AsyncWorker {
    /// Create a new worker.
    pub fn new(plane: Arc<ControlPlane>, config: AsyncWorkerConfig) -> Self {
        Self {
            plane,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop.
    ///
    /// On shutdown, jobs still executing are aborted. Their leases lapse and
    /// another worker picks them up.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            visibility_timeout_secs = self.config.visibility_timeout.as_secs(),
            "Async worker started"
        );

        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Async worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    while let Some(joined) = running.try_join_next() {
                        if let Err(e) = joined {
                            error!(error = %e, "Async job task panicked");
                        }
                    }
                    if let Err(e) = self.claim_batch(&mut running).await {
                        error!(error = %e, "Failed to claim async jobs");
                    }
                }
            }
        }

        if !running.is_empty() {
            warn!(in_flight = running.len(), "Abandoning in-flight async jobs to lease expiry");
            running.abort_all();
            while running.join_next().await.is_some() {}
        }
    }

    /// Claim one batch and spawn a task per job.
    async fn claim_batch(&self, running: &mut JoinSet<()>) -> crate::error::Result<()> {
        let jobs = self
            .plane
            .store()
            .claim_async(self.config.batch_size, self.config.visibility_timeout)
            .await?;

        if jobs.is_empty() {
            debug!("No async jobs to claim");
            return Ok(());
        }

        info!(count = jobs.len(), "Claimed async jobs");

        for job in jobs {
            let plane = self.plane.clone();
            let lease = self.config.visibility_timeout;
            let interval = self.config.heartbeat_interval();
            running.spawn(async move {
                match drive_with_heartbeat(&plane, &job, lease, interval).await {
                    Ok(CoordinatorOutcome::Superseded(status)) => {
                        debug!(job_id = %job.job_id, status = %status, "Async job finished elsewhere");
                    }
                    Ok(CoordinatorOutcome::AlreadyRunning) => {
                        warn!(job_id = %job.job_id, "Async job already running on this worker");
                    }
                    Ok(outcome) => {
                        debug!(job_id = %job.job_id, outcome = ?outcome, "Async job driven");
                    }
                    Err(e) => {
                        // The lease is left in place; the job is retried once it lapses.
                        error!(job_id = %job.job_id, error = %e, "Failed to drive async job");
                    }
                }
            });
        }

        Ok(())
    }
}

/// Drive `job` while renewing its lease every `interval`.
async fn drive_with_heartbeat(
    plane: &ControlPlane,
    job: &Job,
    lease: Duration,
    interval: Duration,
) -> crate::error::Result<CoordinatorOutcome> {
    let drive = plane.drive_async(job);
    tokio::pin!(drive);

    loop {
        tokio::select! {
            biased;

            result = &mut drive => return result,

            _ = tokio::time::sleep(interval) => {
                match plane.store().heartbeat_lease(&job.job_id, lease).await {
                    Ok(true) => debug!(job_id = %job.job_id, "Renewed async job lease"),
                    // Submitted, finished or cancelled; nothing left to renew.
                    Ok(false) => debug!(job_id = %job.job_id, "Async job no longer leased"),
                    Err(e) => warn!(job_id = %job.job_id, error = %e, "Failed to renew async job lease"),
                }
            }
        }
    }
}
