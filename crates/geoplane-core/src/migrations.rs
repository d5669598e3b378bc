// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema of the `jobs` table, one row per execution request.
//!
//! Both backends carry the same columns. Enumerated values (`mode`, `status`,
//! `executed_tier`) are stored as their snake_case names and guarded by CHECK
//! constraints. `parameters`, `outputs` and the `attempts` trail are JSON
//! text. `cost_units` may not go negative.
//!
//! `lease_expires_at` is only set on async jobs held by a worker. A job is
//! claimable while it is async, has no `executed_tier`, and is either
//! `queued` or `running` with a missing or lapsed lease. A partial index over
//! `submitted_at` serves that claim query on PostgreSQL. The other indexes
//! back tenant listings (`tenant_id, submitted_at`) and status filters.
//!
//! Stores opened through `connect` or `from_path` migrate themselves. A host
//! that hands in its own pool runs [`run_postgres`] or [`run_sqlite`] first.

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all job store migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all job store migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations. Already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations. Already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_migrations_create_jobs_table_once() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");

        run_sqlite(&pool).await.expect("first run");
        run_sqlite(&pool).await.expect("second run is a no-op");

        let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('jobs')")
            .fetch_all(&pool)
            .await
            .expect("table info");
        let columns: Vec<String> = columns.into_iter().map(|(name,)| name).collect();
        for expected in ["job_id", "mode", "status", "executed_tier", "attempts", "lease_expires_at"] {
            assert!(columns.iter().any(|c| c == expected), "missing column {}", expected);
        }
    }
}
