//! Filesystem shipyard provider.
//!
//! Reads `<root>/<project>/shipyard.yaml`. The file's modification time is
//! used as the version marker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use super::ShipyardProvider;
use crate::errors::ProviderError;
use crate::model::{ShipyardDocument, VersionedShipyard};

/// File name looked up inside each project directory.
pub const SHIPYARD_FILE: &str = "shipyard.yaml";

/// Provider reading shipyards from a directory tree.
#[derive(Debug, Clone)]
pub struct FileShipyardProvider {
    root: PathBuf,
}

impl FileShipyardProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the path of the shipyard of `project`.
    #[must_use]
    pub fn path_for(&self, project: &str) -> PathBuf {
        self.root.join(project).join(SHIPYARD_FILE)
    }
}

fn version_of(path: &Path, metadata: &std::fs::Metadata) -> String {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or_else(
            || path.display().to_string(),
            |d| format!("{}.{:09}", d.as_secs(), d.subsec_nanos()),
        )
}

#[async_trait]
impl ShipyardProvider for FileShipyardProvider {
    async fn get_shipyard(&self, project: &str) -> Result<Arc<VersionedShipyard>, ProviderError> {
        if project.is_empty() || project.contains(['/', '\\']) || project == ".." {
            return Err(ProviderError::ProjectNotFound(project.to_string()));
        }
        let path = self.path_for(project);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::ProjectNotFound(project.to_string()))
            }
            Err(e) => return Err(ProviderError::Fetch(format!("{}: {e}", path.display()))),
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProviderError::Fetch(format!("{}: {e}", path.display())))?;

        let document = ShipyardDocument::from_yaml(&content)?;
        tracing::debug!(project = %project, path = %path.display(), "Loaded shipyard from file");
        Ok(Arc::new(VersionedShipyard::new(
            version_of(&path, &metadata),
            document,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::REFERENCE_SHIPYARD;

    fn write_project(root: &Path, project: &str, content: &str) {
        let dir = root.join(project);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SHIPYARD_FILE), content).unwrap();
    }

    #[tokio::test]
    async fn test_reads_project_shipyard() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "sockshop", REFERENCE_SHIPYARD);

        let provider = FileShipyardProvider::new(root.path());
        let shipyard = provider.get_shipyard("sockshop").await.unwrap();
        assert_eq!(shipyard.document.metadata.name, "test-shipyard");
        assert!(!shipyard.version.is_empty());
    }

    #[tokio::test]
    async fn test_missing_project() {
        let root = tempfile::tempdir().unwrap();
        let provider = FileShipyardProvider::new(root.path());
        let err = provider.get_shipyard("nope").await.unwrap_err();
        assert!(matches!(err, ProviderError::ProjectNotFound(_)));

        let err = provider.get_shipyard("../etc").await.unwrap_err();
        assert!(matches!(err, ProviderError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_document() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path(), "broken", "kind: Pipeline\napiVersion: v1\nspec: {}\n");
        let provider = FileShipyardProvider::new(root.path());
        let err = provider.get_shipyard("broken").await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }
}
