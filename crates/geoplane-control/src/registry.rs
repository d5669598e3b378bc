// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process registry.
//!
//! A read-only catalog of process definitions loaded once at startup. Loading
//! validates every definition and reports all problems together, so a broken
//! registry file is fixed in one pass instead of one error at a time.
//!
//! # File format
//!
//! ```json
//! [
//!   {
//!     "id": "buffer",
//!     "title": "Buffer geometries",
//!     "version": "1.2.0",
//!     "tiers": ["db_native", "fast_local"],
//!     "handlers": { "db_native": "st_buffer", "fast_local": "buffer" },
//!     "parameters": {
//!       "required": ["distance"],
//!       "properties": { "distance": "number", "units": "string" }
//!     },
//!     "default_resource_class": "burst_cpu",
//!     "estimated_cpu_seconds": 2,
//!     "job_control_options": ["sync", "async"]
//!   }
//! ]
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use geoplane_core::{ExecutionMode, ResourceClass, Tier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Errors from loading or querying the registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// One or more definitions are invalid.
    #[error("invalid process registry: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// No process with this id is registered.
    #[error("process '{0}' is not registered")]
    NotFound(String),

    /// The registry document is not valid JSON for the expected shape.
    #[error("failed to parse process registry: {0}")]
    Parse(#[from] serde_json::Error),

    /// The registry file could not be read.
    #[error("failed to read process registry {path:?}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// JSON type accepted for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// JSON string.
    String,
    /// Any JSON number.
    Number,
    /// JSON number without a fractional part.
    Integer,
    /// JSON boolean.
    Boolean,
    /// JSON object (GeoJSON geometries, feature collections, options).
    Object,
    /// JSON array.
    Array,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Declared inputs of a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameters that must be present.
    #[serde(default)]
    pub required: Vec<String>,
    /// Declared parameter types. Undeclared parameters are passed through unchecked.
    #[serde(default)]
    pub properties: BTreeMap<String, ParamType>,
}

impl ParameterSchema {
    /// Check submitted parameters against the schema.
    pub fn validate(&self, parameters: &Value) -> Result<(), String> {
        let Some(object) = parameters.as_object() else {
            if self.required.is_empty() && parameters.is_null() {
                return Ok(());
            }
            return Err("parameters must be a JSON object".to_string());
        };

        let mut problems = Vec::new();
        for name in &self.required {
            if !object.contains_key(name) {
                problems.push(format!("missing required parameter '{}'", name));
            }
        }
        for (name, value) in object {
            if let Some(expected) = self.properties.get(name)
                && !expected.matches(value)
            {
                problems.push(format!(
                    "parameter '{}' must be of type {}",
                    name,
                    expected.as_str()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

fn default_modes() -> Vec<ExecutionMode> {
    vec![ExecutionMode::Sync, ExecutionMode::Async]
}

/// A declarative process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique process id.
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Definition version.
    #[serde(default)]
    pub version: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Preferred tier order.
    pub tiers: Vec<Tier>,
    /// Handler bound on each tier.
    pub handlers: BTreeMap<Tier, String>,
    /// Declared inputs.
    #[serde(default)]
    pub parameters: ParameterSchema,
    /// Resource class used when the tenant has no override.
    pub default_resource_class: ResourceClass,
    /// CPU-seconds reserved against the tenant's window at admission.
    #[serde(default)]
    pub estimated_cpu_seconds: u64,
    /// Execution modes callers may request.
    #[serde(default = "default_modes")]
    pub job_control_options: Vec<ExecutionMode>,
}

impl ProcessDefinition {
    /// Handler bound on `tier`, if any.
    pub fn handler_for(&self, tier: Tier) -> Option<&str> {
        self.handlers
            .get(&tier)
            .map(String::as_str)
            .filter(|h| !h.trim().is_empty())
    }

    /// Whether callers may request `mode`.
    pub fn allows_mode(&self, mode: ExecutionMode) -> bool {
        self.job_control_options.contains(&mode)
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("process with empty id".to_string());
            return problems;
        }
        if self.tiers.is_empty() {
            problems.push(format!("process '{}' lists no tiers", self.id));
        }
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(*tier) {
                problems.push(format!("process '{}' lists tier {} twice", self.id, tier));
            } else if self.handler_for(*tier).is_none() {
                problems.push(format!(
                    "process '{}' lists tier {} with no bound handler",
                    self.id, tier
                ));
            }
        }
        if self.job_control_options.is_empty() {
            problems.push(format!("process '{}' allows no execution mode", self.id));
        }
        problems
    }
}

/// Read-only catalog of process definitions.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, Arc<ProcessDefinition>>,
}

impl ProcessRegistry {
    /// Build a registry, failing with every problem found if any definition is invalid.
    pub fn load(definitions: Vec<ProcessDefinition>) -> Result<Self, RegistryError> {
        let mut problems = Vec::new();
        let mut seen = HashSet::with_capacity(definitions.len());
        let mut processes = HashMap::with_capacity(definitions.len());

        for definition in definitions {
            // Ids count even for invalid definitions, so a bad first copy
            // cannot hide a duplicate.
            if !definition.id.trim().is_empty() && !seen.insert(definition.id.clone()) {
                problems.push(format!(
                    "process id '{}' is defined more than once",
                    definition.id
                ));
            }
            let definition_problems = definition.problems();
            if !definition_problems.is_empty() {
                problems.extend(definition_problems);
                continue;
            }
            processes.insert(definition.id.clone(), Arc::new(definition));
        }

        if !problems.is_empty() {
            return Err(RegistryError::Invalid(problems));
        }

        info!(processes = processes.len(), "Process registry loaded");
        Ok(Self { processes })
    }

    /// Parse a JSON array of definitions.
    pub fn from_json(source: &str) -> Result<Self, RegistryError> {
        let definitions: Vec<ProcessDefinition> = serde_json::from_str(source)?;
        Self::load(definitions)
    }

    /// Read and parse a registry file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&source)
    }

    /// Look up a definition.
    pub fn get(&self, process_id: &str) -> Result<Arc<ProcessDefinition>, RegistryError> {
        self.processes
            .get(process_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(process_id.to_string()))
    }

    /// All definitions, ordered by id.
    pub fn list(&self) -> Vec<Arc<ProcessDefinition>> {
        let mut all: Vec<_> = self.processes.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
