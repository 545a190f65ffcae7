//! Kubeconfig freshness check.
//!
//! The hub kubeconfig is mounted from a secret that the addon manager rotates.
//! Clients built at startup keep the old credentials, so `healthz` fails once
//! the file changes and the kubelet restarts the container.

use std::path::PathBuf;

use async_trait::async_trait;
use controller_manager::error::ProbeError;
use controller_manager::probes::Checker;
use tracing::debug;

use crate::error::ConfigCheckError;

#[derive(Debug)]
pub struct ConfigChecker {
    name: String,
    snapshots: Vec<(PathBuf, Vec<u8>)>,
}

impl ConfigChecker {
    /// Snapshots the current contents of `paths`.
    ///
    /// With no paths the check always passes.
    pub async fn new(name: &str, paths: impl IntoIterator<Item = PathBuf>) -> Result<Self, ConfigCheckError> {
        let mut snapshots = Vec::new();
        for path in paths {
            let contents = tokio::fs::read(&path)
                .await
                .map_err(|source| ConfigCheckError::Read {
                    path: path.clone(),
                    source,
                })?;
            debug!("Watching {} for changes", path.display());
            snapshots.push((path, contents));
        }
        Ok(Self {
            name: name.to_string(),
            snapshots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Checker for ConfigChecker {
    async fn check(&self) -> Result<(), ProbeError> {
        for (path, snapshot) in &self.snapshots {
            let current = tokio::fs::read(path)
                .await
                .map_err(|e| ProbeError::new(format!("{}: cannot read {}: {}", self.name, path.display(), e)))?;
            if current != *snapshot {
                return Err(ProbeError::new(format!(
                    "{}: {} has changed since startup",
                    self.name,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
