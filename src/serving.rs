use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::sanitize;

/// What the deploy step asks the serving component to expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub key: String,
    pub model_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointReference {
    pub key: String,
    pub url: String,
}

pub trait ServingBackend: Send + Sync {
    fn deploy(&self, request: &DeploymentRequest) -> Result<EndpointReference>;
}

/// Keeps deployments in memory. Used when no serving directory is configured.
#[derive(Debug, Default)]
pub struct MemoryServing {
    deployed: Mutex<Vec<DeploymentRequest>>,
}

impl MemoryServing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployments(&self) -> Vec<DeploymentRequest> {
        self.deployed.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl ServingBackend for MemoryServing {
    fn deploy(&self, request: &DeploymentRequest) -> Result<EndpointReference> {
        self.deployed
            .lock()
            .map_err(|_| anyhow!("Serving registry lock poisoned"))?
            .push(request.clone());
        Ok(EndpointReference {
            key: request.key.clone(),
            url: format!("memory://serving/{}", request.key),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServingManifest {
    pub function: String,
    /// Whether the serving side records request and prediction monitoring.
    #[serde(default)]
    pub tracking: bool,
    pub key: String,
    pub model_path: String,
    pub deployed_at: DateTime<Utc>,
}

/// Writes one manifest per model key for a separate serving process to pick up.
#[derive(Debug, Clone)]
pub struct ManifestServing {
    directory: PathBuf,
    function: String,
    tracking: bool,
}

impl ManifestServing {
    pub fn new(directory: impl Into<PathBuf>, function: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            function: function.into(),
            tracking: false,
        }
    }

    pub fn with_tracking(mut self, tracking: bool) -> Self {
        self.tracking = tracking;
        self
    }
}

impl ServingBackend for ManifestServing {
    fn deploy(&self, request: &DeploymentRequest) -> Result<EndpointReference> {
        std::fs::create_dir_all(&self.directory).with_context(|| {
            format!(
                "Failed to create serving directory: {}",
                self.directory.display()
            )
        })?;
        let path = self
            .directory
            .join(format!("{}.json", sanitize(&request.key)));
        let manifest = ServingManifest {
            function: self.function.clone(),
            tracking: self.tracking,
            key: request.key.clone(),
            model_path: request.model_path.clone(),
            deployed_at: Utc::now(),
        };
        let file = File::create(&path)
            .with_context(|| format!("Failed to create serving manifest: {}", path.display()))?;
        serde_json::to_writer_pretty(file, &manifest)
            .with_context(|| format!("Failed to write serving manifest: {}", path.display()))?;

        let url = format!("local://{}/{}", self.function, request.key);
        info!(key = %request.key, url = %url, "Model deployed");
        Ok(EndpointReference {
            key: request.key.clone(),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn manifest_serving_writes_manifest() {
        let temp = tempdir().unwrap();
        let serving = ManifestServing::new(temp.path().join("serving"), "serving");
        let endpoint = serving
            .deploy(&DeploymentRequest {
                key: "regressor".into(),
                model_path: "/tmp/model.json".into(),
            })
            .unwrap();
        assert_eq!(endpoint.url, "local://serving/regressor");

        let content =
            std::fs::read_to_string(temp.path().join("serving").join("regressor.json")).unwrap();
        let manifest: ServingManifest = serde_json::from_str(&content).unwrap();
        assert_eq!(manifest.model_path, "/tmp/model.json");
        assert!(!manifest.tracking);
    }

    #[test]
    fn tracking_flag_reaches_the_manifest() {
        let temp = tempdir().unwrap();
        let serving = ManifestServing::new(temp.path(), "serving").with_tracking(true);
        serving
            .deploy(&DeploymentRequest {
                key: "regressor".into(),
                model_path: "/tmp/model.json".into(),
            })
            .unwrap();
        let content = std::fs::read_to_string(temp.path().join("regressor.json")).unwrap();
        let manifest: ServingManifest = serde_json::from_str(&content).unwrap();
        assert!(manifest.tracking);
    }

    #[test]
    fn deploy_key_cannot_escape_serving_directory() {
        let temp = tempdir().unwrap();
        let directory = temp.path().join("out").join("serving");
        let serving = ManifestServing::new(&directory, "serving");
        serving
            .deploy(&DeploymentRequest {
                key: "../../escaped".into(),
                model_path: "/tmp/model.json".into(),
            })
            .unwrap();
        assert!(!temp.path().join("escaped.json").exists());
        assert!(directory.join(".._.._escaped.json").is_file());
    }
}
