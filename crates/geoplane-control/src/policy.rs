// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant policy overrides.
//!
//! Overrides are resolved per admission through a [`TenantPolicySource`] and
//! the resolved value travels with the request. Nothing reads tenant policy
//! from shared global state.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use geoplane_core::{ResourceClass, Tier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a policy source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The policy backend could not be reached.
    #[error("policy source unavailable: {0}")]
    Unavailable(String),

    /// The policy document is malformed.
    #[error("invalid tenant policy: {0}")]
    Invalid(String),
}

/// Per-tenant adjustments for one process. Unset fields use process defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicyOverride {
    /// Tenant the override applies to.
    pub tenant_id: String,
    /// Process the override applies to.
    pub process_id: String,
    /// Tier order to use instead of the process's preferred order.
    #[serde(default)]
    pub forced_tiers: Option<Vec<Tier>>,
    /// Resource class to use instead of the process default.
    #[serde(default)]
    pub resource_class: Option<ResourceClass>,
    /// Upper bound on cost units for one job.
    #[serde(default)]
    pub cost_cap: Option<u64>,
}

/// Source of tenant policy overrides.
#[async_trait]
pub trait TenantPolicySource: Send + Sync {
    /// Override for `tenant_id` running `process_id`, or `None` for defaults.
    async fn get_override(
        &self,
        tenant_id: &str,
        process_id: &str,
    ) -> Result<Option<TenantPolicyOverride>, PolicyError>;
}

/// Policy source backed by a fixed set of overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    overrides: HashMap<(String, String), TenantPolicyOverride>,
}

impl StaticPolicySource {
    /// A source with no overrides.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a list of overrides. A later entry for the same tenant and process wins.
    pub fn new(overrides: impl IntoIterator<Item = TenantPolicyOverride>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|o| ((o.tenant_id.clone(), o.process_id.clone()), o))
            .collect();
        Self { overrides }
    }

    /// Load a JSON array of overrides from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Unavailable(format!("{:?}: {}", path, e)))?;
        let overrides: Vec<TenantPolicyOverride> =
            serde_json::from_str(&source).map_err(|e| PolicyError::Invalid(e.to_string()))?;
        Ok(Self::new(overrides))
    }

    /// Number of overrides.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    /// Whether there are no overrides.
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[async_trait]
impl TenantPolicySource for StaticPolicySource {
    async fn get_override(
        &self,
        tenant_id: &str,
        process_id: &str,
    ) -> Result<Option<TenantPolicyOverride>, PolicyError> {
        Ok(self
            .overrides
            .get(&(tenant_id.to_string(), process_id.to_string()))
            .cloned())
    }
}
