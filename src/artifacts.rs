use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::evaluation::ModelMetrics;
use crate::model::LinearModel;
use crate::serving::{DeploymentRequest, EndpointReference};
use crate::table::Table;

/// Values that flow between steps. Once stored they are never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactValue {
    Table(Table),
    Model(LinearModel),
    Metrics(ModelMetrics),
    Deployment(DeploymentRequest),
    Endpoint(EndpointReference),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Table,
    Model,
    Metrics,
    Deployment,
    Endpoint,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Table => "table",
            ArtifactKind::Model => "model",
            ArtifactKind::Metrics => "metrics",
            ArtifactKind::Deployment => "deployment",
            ArtifactKind::Endpoint => "endpoint",
        }
    }
}

impl ArtifactValue {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactValue::Table(_) => ArtifactKind::Table,
            ArtifactValue::Model(_) => ArtifactKind::Model,
            ArtifactValue::Metrics(_) => ArtifactKind::Metrics,
            ArtifactValue::Deployment(_) => ArtifactKind::Deployment,
            ArtifactValue::Endpoint(_) => ArtifactKind::Endpoint,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            ArtifactValue::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&LinearModel> {
        match self {
            ArtifactValue::Model(model) => Some(model),
            _ => None,
        }
    }

    pub fn as_metrics(&self) -> Option<&ModelMetrics> {
        match self {
            ArtifactValue::Metrics(metrics) => Some(metrics),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&EndpointReference> {
        match self {
            ArtifactValue::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode artifact")
    }
}

/// Handle to a stored artifact. References are content-addressed: storing an
/// identical value under the same name yields an identical reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub kind: ArtifactKind,
    pub uri: String,
    pub digest: String,
}

pub trait ArtifactStore: Send + Sync {
    fn put(&self, name: &str, value: ArtifactValue) -> Result<ArtifactRef>;
    fn get(&self, reference: &ArtifactRef) -> Result<Arc<ArtifactValue>>;
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    values: Mutex<HashMap<String, Arc<ArtifactValue>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().map(|g| g.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, name: &str, value: ArtifactValue) -> Result<ArtifactRef> {
        let digest = digest_bytes(&value.encode()?);
        let reference = ArtifactRef {
            name: name.to_string(),
            kind: value.kind(),
            uri: format!("memory://{}/{}", name, &digest[..16]),
            digest,
        };
        let mut guard = self
            .values
            .lock()
            .map_err(|_| anyhow!("Artifact store lock poisoned"))?;
        guard
            .entry(reference.uri.clone())
            .or_insert_with(|| Arc::new(value));
        Ok(reference)
    }

    fn get(&self, reference: &ArtifactRef) -> Result<Arc<ArtifactValue>> {
        let guard = self
            .values
            .lock()
            .map_err(|_| anyhow!("Artifact store lock poisoned"))?;
        guard
            .get(&reference.uri)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown artifact: {}", reference.uri))
    }
}

/// Persists artifacts as JSON under `<root>/<name>/<digest>.json`.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for FileArtifactStore {
    fn put(&self, name: &str, value: ArtifactValue) -> Result<ArtifactRef> {
        let encoded = value.encode()?;
        let digest = digest_bytes(&encoded);
        let dir = self.root.join(sanitize(name));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.json", &digest[..16]));
        if !path.exists() {
            fs::write(&path, &encoded)
                .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        }
        debug!(artifact = name, path = %path.display(), "Artifact persisted");

        Ok(ArtifactRef {
            name: name.to_string(),
            kind: value.kind(),
            uri: path.to_string_lossy().to_string(),
            digest,
        })
    }

    fn get(&self, reference: &ArtifactRef) -> Result<Arc<ArtifactValue>> {
        let path = Path::new(&reference.uri);
        let encoded = fs::read(path)
            .with_context(|| format!("Failed to read artifact: {}", path.display()))?;
        if digest_bytes(&encoded) != reference.digest {
            bail!(
                "Artifact '{}' at {} does not match its recorded digest",
                reference.name,
                path.display()
            );
        }
        let value: ArtifactValue = serde_json::from_slice(&encoded)
            .with_context(|| format!("Failed to decode artifact: {}", path.display()))?;
        Ok(Arc::new(value))
    }
}

/// File-name-safe form of an artifact or model name.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_table() -> ArtifactValue {
        ArtifactValue::Table(
            Table::from_rows(
                vec!["id".into(), "price".into()],
                vec![vec![Value::Int(1), Value::Float(2.5)]],
            )
            .unwrap(),
        )
    }

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"shuttle").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "48f42260a8448caa7a9ca1af2630a086da42c48fb009755da7e8bac819490836"
        );
    }

    #[test]
    fn memory_store_is_content_addressed() {
        let store = MemoryArtifactStore::new();
        let first = store.put("companies", sample_table()).unwrap();
        let second = store.put("companies", sample_table()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(*store.get(&first).unwrap(), sample_table());
    }

    #[test]
    fn file_store_round_trips_and_detects_tampering() {
        let temp = tempdir().unwrap();
        let store = FileArtifactStore::new(temp.path().join("artifacts")).unwrap();
        let reference = store.put("model_input_table", sample_table()).unwrap();
        assert_eq!(reference.kind, ArtifactKind::Table);
        assert_eq!(*store.get(&reference).unwrap(), sample_table());

        fs::write(&reference.uri, b"{\"kind\":\"table\"}").unwrap();
        assert!(store.get(&reference).is_err());
    }

    #[test]
    fn changed_value_supersedes_instead_of_overwriting() {
        let temp = tempdir().unwrap();
        let store = FileArtifactStore::new(temp.path()).unwrap();
        let first = store.put("t", sample_table()).unwrap();
        let second = store
            .put("t", ArtifactValue::Table(Table::new(vec!["id".into()])))
            .unwrap();
        assert_ne!(first.uri, second.uri);
        assert!(store.get(&first).is_ok());
        assert!(store.get(&second).is_ok());
    }
}
