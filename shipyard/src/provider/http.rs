//! Configuration-service shipyard provider.
//!
//! Resources are served as JSON with base64 encoded content:
//!
//! ```json
//! {"resourceURI": "shipyard.yaml", "resourceContent": "YXBpVmVyc2lvbjog..."}
//! ```
//!
//! The shipyard lives at `/v1/project/<project>/resource/shipyard.yaml`, and
//! its version marker is the `metadata.version` of
//! `/v1/project/<project>/resource/metadata.yaml`.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;

use crate::errors::ProviderError;
use crate::model::ShipyardDocument;

/// Version reported when the provider exposes none.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A resource as returned by the configuration service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource path.
    #[serde(default, rename = "resourceURI")]
    pub resource_uri: Option<String>,
    /// Base64 encoded content.
    #[serde(default)]
    pub resource_content: Option<String>,
    /// Version metadata.
    #[serde(default)]
    pub metadata: Option<ResourceMetadata>,
}

/// Version block of a resource.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceMetadata {
    /// Commit or version ID.
    #[serde(default)]
    pub version: Option<String>,
}

/// Decodes the shipyard out of a resource body.
pub fn decode_resource(body: &[u8]) -> Result<ShipyardDocument, ProviderError> {
    let resource: Resource =
        serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let encoded = resource
        .resource_content
        .ok_or_else(|| ProviderError::Decode("resource has no content".to_string()))?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProviderError::Decode(format!("invalid base64: {e}")))?;
    let content =
        String::from_utf8(bytes).map_err(|e| ProviderError::Decode(format!("invalid UTF-8: {e}")))?;
    Ok(ShipyardDocument::from_yaml(&content)?)
}

/// Extracts the version marker out of a metadata resource body.
#[must_use]
pub fn decode_version(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Resource>(body)
        .ok()?
        .metadata?
        .version
        .filter(|v| !v.is_empty())
}

#[cfg(feature = "http-provider")]
mod client {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};

    use super::{decode_resource, decode_version, UNKNOWN_VERSION};
    use crate::errors::ProviderError;
    use crate::model::VersionedShipyard;
    use crate::provider::ShipyardProvider;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Provider fetching shipyards from the configuration service over HTTP.
    #[derive(Debug, Clone)]
    pub struct HttpShipyardProvider {
        client: Client,
        base_url: String,
    }

    impl HttpShipyardProvider {
        /// Creates a provider for `endpoint` (`host:port` or a full URL).
        #[must_use]
        pub fn new(endpoint: &str) -> Self {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                    Client::new()
                });
            let endpoint = endpoint.trim_end_matches('/');
            let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.to_string()
            } else {
                format!("http://{endpoint}")
            };
            Self { client, base_url }
        }

        fn resource_url(&self, project: &str, resource: &str) -> String {
            format!("{}/v1/project/{project}/resource/{resource}", self.base_url)
        }

        async fn fetch(&self, project: &str, resource: &str) -> Result<Vec<u8>, ProviderError> {
            let url = self.resource_url(project, resource);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ProviderError::Fetch(format!("GET {url}: {e}")))?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(ProviderError::ProjectNotFound(project.to_string())),
                status if !status.is_success() => {
                    Err(ProviderError::Fetch(format!("GET {url}: HTTP {status}")))
                }
                _ => response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| ProviderError::Fetch(format!("GET {url}: {e}"))),
            }
        }
    }

    #[async_trait]
    impl ShipyardProvider for HttpShipyardProvider {
        async fn get_shipyard(
            &self,
            project: &str,
        ) -> Result<Arc<VersionedShipyard>, ProviderError> {
            let body = self.fetch(project, "shipyard.yaml").await?;
            let document = decode_resource(&body)?;

            let version = match self.fetch(project, "metadata.yaml").await {
                Ok(body) => decode_version(&body),
                Err(e) => {
                    tracing::debug!(project = %project, error = %e, "No shipyard version available");
                    None
                }
            };

            Ok(Arc::new(VersionedShipyard::new(
                version.unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
                document,
            )))
        }
    }

}

#[cfg(feature = "http-provider")]
pub use client::HttpShipyardProvider;
