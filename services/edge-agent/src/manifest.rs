//! File-backed source of desired pods.
//!
//! The manifest is a JSON document of the form `{"pods": [...]}`. It is
//! re-read on every sync pass so edits take effect without a restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pod::{Pod, PodUid};

/// Manifest loading errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest lists pod uid {0} more than once")]
    DuplicateUid(PodUid),

    #[error("manifest pod {0} has an empty uid")]
    EmptyUid(String),

    #[error("manifest pod {pod} must have exactly one container, found {count}")]
    ContainerCount { pod: String, count: usize },
}

/// On-disk manifest layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl Manifest {
    /// Parse and validate a manifest.
    pub fn from_slice(path: &Path, bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut seen = HashSet::new();
        for pod in &manifest.pods {
            if pod.uid.is_empty() {
                return Err(ManifestError::EmptyUid(pod.full_name()));
            }
            if !seen.insert(&pod.uid) {
                return Err(ManifestError::DuplicateUid(pod.uid.clone()));
            }
            if pod.containers.len() != 1 {
                return Err(ManifestError::ContainerCount {
                    pod: pod.full_name(),
                    count: pod.containers.len(),
                });
            }
        }
        Ok(manifest)
    }
}

/// Reads desired pods from a manifest file.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current list of desired pods.
    pub async fn load(&self) -> Result<Vec<Pod>, ManifestError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ManifestError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(Manifest::from_slice(&self.path, &bytes)?.pods)
    }
}
