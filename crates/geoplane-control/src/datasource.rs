// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-source compatibility lookup: where is a referenced dataset hosted?

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hosting provider of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// A PostGIS database reachable by the database-native tier.
    Postgis,
    /// An object store bucket (S3, GCS, Azure Blob).
    ObjectStorage,
    /// A file on a shared filesystem.
    File,
    /// Data passed inline with the request.
    Inline,
    /// Provider could not be determined.
    Unknown,
}

impl ProviderType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgis => "postgis",
            Self::ObjectStorage => "object_storage",
            Self::File => "file",
            Self::Inline => "inline",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves the hosting provider of a referenced dataset.
#[async_trait]
pub trait DataSourceResolver: Send + Sync {
    /// Provider hosting `dataset_ref`. `None` means the request carries its data inline.
    async fn resolve(&self, dataset_ref: Option<&str>) -> ProviderType;
}

/// Resolver that classifies dataset references by URI scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeResolver;

impl SchemeResolver {
    /// Classify a reference without any I/O.
    pub fn classify(dataset_ref: Option<&str>) -> ProviderType {
        let Some(reference) = dataset_ref.map(str::trim).filter(|r| !r.is_empty()) else {
            return ProviderType::Inline;
        };
        let Some((scheme, _)) = reference.split_once("://") else {
            return if reference.starts_with('/') {
                ProviderType::File
            } else {
                ProviderType::Unknown
            };
        };
        match scheme.to_ascii_lowercase().as_str() {
            "postgis" | "postgres" | "postgresql" => ProviderType::Postgis,
            "s3" | "gs" | "gcs" | "az" | "abfs" | "abfss" => ProviderType::ObjectStorage,
            "file" => ProviderType::File,
            _ => ProviderType::Unknown,
        }
    }
}

#[async_trait]
impl DataSourceResolver for SchemeResolver {
    async fn resolve(&self, dataset_ref: Option<&str>) -> ProviderType {
        Self::classify(dataset_ref)
    }
}
