//! Shipyard configuration providers.
//!
//! The engine never reads shipyards directly; it asks a [`ShipyardProvider`]
//! for the current document of a project and snapshots the task plan into the
//! execution record at creation time.

pub mod file;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::ProviderError;
use crate::model::{ShipyardDocument, VersionedShipyard};

pub use file::FileShipyardProvider;
#[cfg(feature = "http-provider")]
pub use http::HttpShipyardProvider;

/// Source of shipyard documents.
#[async_trait]
pub trait ShipyardProvider: Send + Sync {
    /// Returns the current shipyard of `project`.
    async fn get_shipyard(&self, project: &str) -> Result<Arc<VersionedShipyard>, ProviderError>;
}

/// Provider holding shipyards registered in memory.
#[derive(Debug, Default)]
pub struct StaticShipyardProvider {
    shipyards: DashMap<String, Arc<VersionedShipyard>>,
}

impl StaticShipyardProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider with one project registered.
    #[must_use]
    pub fn with_project(project: impl Into<String>, document: ShipyardDocument) -> Self {
        let provider = Self::new();
        provider.insert(project, "1", document);
        provider
    }

    /// Registers or replaces the shipyard of `project`.
    pub fn insert(
        &self,
        project: impl Into<String>,
        version: impl Into<String>,
        document: ShipyardDocument,
    ) {
        self.shipyards.insert(
            project.into(),
            Arc::new(VersionedShipyard::new(version, document)),
        );
    }

    /// Removes the shipyard of `project`.
    pub fn remove(&self, project: &str) {
        self.shipyards.remove(project);
    }
}

#[async_trait]
impl ShipyardProvider for StaticShipyardProvider {
    async fn get_shipyard(&self, project: &str) -> Result<Arc<VersionedShipyard>, ProviderError> {
        self.shipyards
            .get(project)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProviderError::ProjectNotFound(project.to_string()))
    }
}
