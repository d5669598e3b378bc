// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for geoplane-core store tests.

#![allow(dead_code)]

use geoplane_core::{ExecutionMode, NewJob, PostgresJobStore, ResourceClass, SqliteJobStore};

/// File-backed SQLite store with a multi-connection pool, so concurrent
/// writers really race instead of queueing on a single connection.
pub struct SqliteContext {
    pub store: SqliteJobStore,
    _dir: tempfile::TempDir,
}

impl SqliteContext {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("jobs.db");
        let store = SqliteJobStore::from_path(&path)
            .await
            .expect("Failed to open SQLite store");
        Self { store, _dir: dir }
    }
}

/// PostgreSQL store from TEST_GEOPLANE_DATABASE_URL, or None when unset.
pub async fn postgres_store() -> Option<PostgresJobStore> {
    let url = std::env::var("TEST_GEOPLANE_DATABASE_URL").ok()?;
    PostgresJobStore::connect(&url, 10).await.ok()
}

/// Build a job request for `tenant_id`.
pub fn new_job(tenant_id: &str, mode: ExecutionMode) -> NewJob {
    NewJob {
        job_id: NewJob::generate_id(),
        process_id: "buffer".to_string(),
        tenant_id: tenant_id.to_string(),
        parameters: serde_json::json!({"distance": 25, "units": "m"}),
        dataset_ref: None,
        resource_class: ResourceClass::BurstCpu,
        mode,
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_GEOPLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_GEOPLANE_DATABASE_URL not set");
            return;
        }
    };
}
