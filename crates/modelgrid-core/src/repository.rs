//! Read interface to the versioned model repository.
//!
//! The coordinator only ever asks "give me bundle `name:version`". The
//! filesystem implementation expects one directory per bundle at
//! `{root}/{name}/{version}/` holding a `bentoml.yml` metadata file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Metadata file every bundle directory carries.
pub const MANIFEST_FILE: &str = "bentoml.yml";

/// Dependency manifest declared by a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub python_version: String,
    #[serde(default)]
    pub pip_packages: Vec<String>,
}

/// A resolved bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleRef {
    pub name: String,
    pub version: String,
    /// Bundle content directory (also the image build context).
    pub path: PathBuf,
    pub manifest: DependencyManifest,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("bundle {name}:{version} does not exist in the model repository")]
    NotFound { name: String, version: String },

    #[error("invalid bundle at {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn fetch(&self, name: &str, version: &str) -> Result<BundleRef, RepositoryError>;
}

#[derive(Debug, Deserialize)]
struct BundleMetadata {
    env: DependencyManifest,
}

/// Repository backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsModelRepository {
    root: PathBuf,
}

impl FsModelRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Names and versions become path components; keep them to one component.
fn is_safe_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

#[async_trait]
impl ModelRepository for FsModelRepository {
    async fn fetch(&self, name: &str, version: &str) -> Result<BundleRef, RepositoryError> {
        let not_found = || RepositoryError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        };
        if !is_safe_component(name) || !is_safe_component(version) {
            return Err(not_found());
        }

        let path = self.root.join(name).join(version);
        let manifest_path = path.join(MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let metadata: BundleMetadata =
            serde_yaml::from_str(&raw).map_err(|e| RepositoryError::Invalid {
                path: manifest_path.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!(%name, %version, path = %path.display(), "bundle resolved");
        Ok(BundleRef {
            name: name.to_string(),
            version: version.to_string(),
            path,
            manifest: metadata.env,
        })
    }
}
