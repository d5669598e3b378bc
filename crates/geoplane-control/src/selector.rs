// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tier selection.
//!
//! Maps a process definition, the tenant's resolved override and the dataset's
//! hosting provider to an ordered list of candidate tiers. The shipped
//! [`DeterministicSelector`] is a pure function of those three inputs; other
//! strategies plug in through [`TierSelector`] without touching callers.

use std::collections::HashSet;

use geoplane_core::Tier;
use tracing::{debug, info};

use crate::datasource::ProviderType;
use crate::error::Error;
use crate::policy::TenantPolicyOverride;
use crate::registry::ProcessDefinition;

/// A tier removed from the candidate list and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedTier {
    /// The removed tier.
    pub tier: Tier,
    /// Why it was removed.
    pub reason: String,
}

/// Result of tier selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    /// Surviving tiers, in attempt order.
    pub candidates: Vec<Tier>,
    /// Removed tiers, in the order they were considered.
    pub removed: Vec<RemovedTier>,
}

impl Selection {
    /// Whether no candidate survived.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Surviving candidates, or `NoCompatibleTier` when there are none.
    pub fn into_candidates(self, process_id: &str) -> Result<Vec<Tier>, Error> {
        if self.candidates.is_empty() {
            return Err(Error::NoCompatibleTier {
                process_id: process_id.to_string(),
                reasons: self
                    .removed
                    .into_iter()
                    .map(|r| format!("{}: {}", r.tier, r.reason))
                    .collect(),
            });
        }
        Ok(self.candidates)
    }
}

/// Strategy that orders candidate tiers for a request.
pub trait TierSelector: Send + Sync {
    /// Ordered candidate tiers. Must never add a tier absent from the
    /// candidate order it starts from.
    fn select(
        &self,
        definition: &ProcessDefinition,
        policy: Option<&TenantPolicyOverride>,
        provider: ProviderType,
    ) -> Selection;
}

/// Whether `tier` can operate on data hosted by `provider`.
pub fn check_locality(tier: Tier, provider: ProviderType) -> Result<(), String> {
    match (tier, provider) {
        (Tier::FastLocal | Tier::CloudBatch, _) => Ok(()),
        (Tier::DbNative, ProviderType::Postgis) => Ok(()),
        (Tier::DbNative, ProviderType::Inline) => {
            Err("inline data cannot be processed inside the database".to_string())
        }
        (Tier::DbNative, other) => Err(format!(
            "dataset is hosted on {}, not in a PostGIS database",
            other
        )),
    }
}

/// Forced order if the tenant has one, otherwise the process's preferred
/// order, filtered by handler binding and data locality.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicSelector;

impl TierSelector for DeterministicSelector {
    fn select(
        &self,
        definition: &ProcessDefinition,
        policy: Option<&TenantPolicyOverride>,
        provider: ProviderType,
    ) -> Selection {
        let order = match policy.and_then(|p| p.forced_tiers.as_ref()) {
            Some(forced) => {
                debug!(process_id = %definition.id, tiers = ?forced, "Using tenant-forced tier order");
                forced.as_slice()
            }
            None => definition.tiers.as_slice(),
        };

        let mut selection = Selection::default();
        let mut seen = HashSet::new();

        for &tier in order {
            if !seen.insert(tier) {
                continue;
            }

            let verdict = if definition.handler_for(tier).is_none() {
                Err("process has no handler bound on this tier".to_string())
            } else {
                check_locality(tier, provider)
            };

            match verdict {
                Ok(()) => selection.candidates.push(tier),
                Err(reason) => {
                    info!(
                        process_id = %definition.id,
                        tier = %tier,
                        provider = %provider,
                        reason = %reason,
                        "Tier removed from candidates"
                    );
                    selection.removed.push(RemovedTier { tier, reason });
                }
            }
        }

        selection
    }
}
