// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor module - execution tier backends.

pub mod local;
pub mod mock;
mod traits;

use std::collections::HashMap;
use std::sync::Arc;

use geoplane_core::Tier;

pub use local::{EchoHandler, HandlerOutput, LocalExecutor, ProcessHandler};
pub use mock::{MockBehavior, MockExecutor};
pub use traits::*;

/// Executors keyed by the tier they serve.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<Tier, Arc<dyn TierExecutor>>,
}

impl ExecutorSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own tier, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn TierExecutor>) {
        self.executors.insert(executor.tier(), executor);
    }

    /// Builder form of [`ExecutorSet::register`].
    pub fn with(mut self, executor: Arc<dyn TierExecutor>) -> Self {
        self.register(executor);
        self
    }

    /// Executor serving `tier`.
    pub fn get(&self, tier: Tier) -> Option<&Arc<dyn TierExecutor>> {
        self.executors.get(&tier)
    }

    /// Tiers with a registered executor.
    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self.executors.keys().copied().collect();
        tiers.sort();
        tiers
    }

    /// Whether no executor is registered.
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSet")
            .field("tiers", &self.tiers())
            .finish()
    }
}
