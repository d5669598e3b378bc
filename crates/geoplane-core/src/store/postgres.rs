// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job store.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::job::{ExecutionMode, Job, JobStatus, NewJob, Tier, TierAttempt};
use crate::migrations;

use super::{
    EncodedPayload, JOB_COLUMNS, JobFilter, JobPage, JobRow, JobStore, Pagination, StatusPayload,
    Transition, invalid_transition, lease_deadline, map_insert_error, missed_transition,
    validate_new_job,
};

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a PostgreSQL URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::database("connect", e))?;

        migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE job_id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: &NewJob) -> Result<Job> {
        validate_new_job(job)?;

        let sql = format!(
            r#"
            INSERT INTO jobs (
                job_id, process_id, tenant_id, parameters, dataset_ref, resource_class,
                mode, status, submitted_at, started_at, cost_units, attempts, trace_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, '[]', $11)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let now = Utc::now();
        let status = job.initial_status();
        let started_at = (status == JobStatus::Running).then_some(now);

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&job.job_id)
            .bind(&job.process_id)
            .bind(&job.tenant_id)
            .bind(serde_json::to_string(&job.parameters)?)
            .bind(&job.dataset_ref)
            .bind(job.resource_class.as_str())
            .bind(job.mode.as_str())
            .bind(status.as_str())
            .bind(now)
            .bind(started_at)
            .bind(&job.trace_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_insert_error(&job.job_id, e))?;

        debug!(job_id = %job.job_id, status = %status, "Job created");
        Job::try_from(row)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        self.fetch(job_id).await
    }

    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        payload: &StatusPayload,
    ) -> Result<Transition> {
        if !expected.can_transition_to(next) {
            let current = self.fetch(job_id).await?;
            return invalid_transition(job_id, current, expected, next);
        }

        let encoded = EncodedPayload::encode(payload)?;
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $1,
                executed_tier = COALESCE(executed_tier, $2),
                cost_units = GREATEST(cost_units, COALESCE($3, cost_units)),
                result_ref = COALESCE($4, result_ref),
                outputs = COALESCE($5, outputs),
                error_detail = COALESCE($6, error_detail),
                attempts = COALESCE($7, attempts),
                started_at = CASE WHEN $1 = 'running' THEN COALESCE(started_at, $8) ELSE started_at END,
                completed_at = CASE WHEN $1 IN ('succeeded', 'failed', 'cancelled') THEN $8 ELSE completed_at END,
                lease_expires_at = CASE WHEN $1 IN ('succeeded', 'failed', 'cancelled') THEN NULL ELSE lease_expires_at END
            WHERE job_id = $9 AND status = $10
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(next.as_str())
            .bind(encoded.executed_tier)
            .bind(encoded.cost_units)
            .bind(encoded.result_ref)
            .bind(encoded.outputs)
            .bind(encoded.error_detail)
            .bind(encoded.attempts)
            .bind(Utc::now())
            .bind(job_id)
            .bind(expected.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                debug!(job_id = %job_id, from = %expected, to = %next, "Job status updated");
                Ok(Transition::Applied(Job::try_from(row)?))
            }
            None => {
                let current = self.fetch(job_id).await?;
                missed_transition(job_id, current)
            }
        }
    }

    async fn query(&self, filter: &JobFilter, page: &Pagination) -> Result<JobPage> {
        const WHERE: &str = r#"
            WHERE ($1::text IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR process_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR submitted_at >= $4)
              AND ($5::timestamptz IS NULL OR submitted_at < $5)
        "#;

        let status = filter.status.map(|s| s.as_str());

        let list_sql = format!(
            "SELECT {} FROM jobs {} ORDER BY submitted_at DESC, job_id LIMIT $6 OFFSET $7",
            JOB_COLUMNS, WHERE
        );
        let rows = sqlx::query_as::<_, JobRow>(&list_sql)
            .bind(&filter.tenant_id)
            .bind(&filter.process_id)
            .bind(status)
            .bind(filter.submitted_after)
            .bind(filter.submitted_before)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", WHERE);
        let (total_count,): (i64,) = sqlx::query_as(&count_sql)
            .bind(&filter.tenant_id)
            .bind(&filter.process_id)
            .bind(status)
            .bind(filter.submitted_after)
            .bind(filter.submitted_before)
            .fetch_one(&self.pool)
            .await?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(JobPage { jobs, total_count })
    }

    async fn claim_async(&self, limit: i64, lease: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let deadline = lease_deadline(lease)?;

        // SKIP LOCKED lets concurrent workers claim disjoint batches.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, $1),
                lease_expires_at = $2
            WHERE job_id IN (
                SELECT job_id FROM jobs
                WHERE mode = 'async'
                  AND executed_tier IS NULL
                  AND (status = 'queued'
                       OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at < $1)))
                ORDER BY submitted_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(deadline)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "Claimed async jobs");
        }
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn requeue_async(&self, job_id: &str, attempts: &[TierAttempt]) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET mode = $1,
                lease_expires_at = NULL,
                attempts = $2
            WHERE job_id = $3
              AND status = 'running'
              AND executed_tier IS NULL
            "#,
        )
        .bind(ExecutionMode::Async.as_str())
        .bind(serde_json::to_string(attempts)?)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_submitted(
        &self,
        job_id: &str,
        tier: Tier,
        attempts: &[TierAttempt],
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET executed_tier = COALESCE(executed_tier, $1),
                attempts = $2,
                lease_expires_at = NULL
            WHERE job_id = $3 AND status = 'running'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tier.as_str())
            .bind(serde_json::to_string(attempts)?)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn heartbeat_lease(&self, job_id: &str, lease: Duration) -> Result<bool> {
        let deadline = lease_deadline(lease)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1
            WHERE job_id = $2
              AND status = 'running'
              AND mode = 'async'
              AND executed_tier IS NULL
              AND lease_expires_at IS NOT NULL
            "#,
        )
        .bind(deadline)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_attempts(&self, job_id: &str, attempts: &[TierAttempt]) -> Result<bool> {
        let result =
            sqlx::query("UPDATE jobs SET attempts = $1 WHERE job_id = $2 AND status = 'running'")
                .bind(serde_json::to_string(attempts)?)
                .bind(job_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i32,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
