use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::{ArtifactRef, sanitize};

/// Registry entry for one trained model and the metrics reported against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub model_path: String,
    pub digest: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

/// Tracking collaborator notified by the executor. Steps never talk to it directly.
pub trait ModelRegistry: Send + Sync {
    fn save_model(&self, name: &str, model: &ArtifactRef) -> Result<ModelRecord>;
    fn report_metric(&self, model: &ArtifactRef, name: &str, value: f64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryModelRegistry {
    records: Mutex<HashMap<String, ModelRecord>>,
}

impl MemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_for(&self, model: &ArtifactRef) -> Option<ModelRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|g| g.get(&model.digest).cloned())
    }
}

impl ModelRegistry for MemoryModelRegistry {
    fn save_model(&self, name: &str, model: &ArtifactRef) -> Result<ModelRecord> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| anyhow!("Model registry lock poisoned"))?;
        let record = guard
            .entry(model.digest.clone())
            .or_insert_with(|| new_record(name, model));
        Ok(record.clone())
    }

    fn report_metric(&self, model: &ArtifactRef, name: &str, value: f64) -> Result<()> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| anyhow!("Model registry lock poisoned"))?;
        let record = guard
            .entry(model.digest.clone())
            .or_insert_with(|| new_record(&model.name, model));
        record.metrics.insert(name.to_string(), value);
        record.updated_at = Utc::now();
        Ok(())
    }
}

/// Stores one JSON record per model under `<root>/<name>.json`.
#[derive(Debug)]
pub struct FileModelRegistry {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create registry directory: {}", root.display()))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn load(&self, name: &str) -> Result<Option<ModelRecord>> {
        read_record(&self.record_path(name))
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(name)))
    }
}

impl ModelRegistry for FileModelRegistry {
    fn save_model(&self, name: &str, model: &ArtifactRef) -> Result<ModelRecord> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("Model registry lock poisoned"))?;
        let path = self.record_path(name);
        let record = match read_record(&path)? {
            Some(existing) if existing.digest == model.digest => existing,
            _ => new_record(name, model),
        };
        write_record(&path, &record)?;
        info!(model = name, path = %record.model_path, "Model registered");
        Ok(record)
    }

    fn report_metric(&self, model: &ArtifactRef, name: &str, value: f64) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("Model registry lock poisoned"))?;
        let path = self.record_path(&model.name);
        let mut record = match read_record(&path)? {
            Some(existing) if existing.digest == model.digest => existing,
            _ => new_record(&model.name, model),
        };
        record.metrics.insert(name.to_string(), value);
        record.updated_at = Utc::now();
        write_record(&path, &record)
    }
}

fn new_record(name: &str, model: &ArtifactRef) -> ModelRecord {
    ModelRecord {
        name: name.to_string(),
        model_path: model.uri.clone(),
        digest: model.digest.clone(),
        metrics: BTreeMap::new(),
        updated_at: Utc::now(),
    }
}

fn read_record(path: &Path) -> Result<Option<ModelRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry record: {}", path.display()))?;
    let record = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse registry record: {}", path.display()))?;
    Ok(Some(record))
}

fn write_record(path: &Path, record: &ModelRecord) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create registry record: {}", path.display()))?;
    serde_json::to_writer_pretty(file, record)
        .with_context(|| format!("Failed to write registry record: {}", path.display()))
}
