use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifacts::compute_sha256;
use crate::pipeline::{StepRegistry, StepSpec, build_graph};
use crate::recipe::Recipe;

/// Everything needed to tell whether two runs saw the same inputs and configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineLock {
    pub recipe_version: u32,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    pub inputs: BTreeMap<String, InputLock>,
    pub parameters_hash: String,
    pub output: OutputLock,
    pub steps: Vec<StepLock>,
    pub execution_order: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputLock {
    pub path: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutputLock {
    pub directory: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepLock {
    pub name: String,
    pub handler: String,
    pub params_hash: String,
}

pub fn generate_lock(recipe: &Recipe, registry: &StepRegistry, path: &Path) -> Result<PipelineLock> {
    let graph = build_graph(registry, &recipe.name, recipe.inputs.keys(), &recipe.steps)?;
    let parameters = recipe.parameters.resolve()?;

    let mut inputs = BTreeMap::new();
    for (name, input) in &recipe.inputs {
        let sha256 = if input.is_file() {
            Some(compute_sha256(input)?)
        } else {
            None
        };
        inputs.insert(
            name.clone(),
            InputLock {
                path: input.to_string_lossy().to_string(),
                sha256,
            },
        );
    }

    let lock = PipelineLock {
        recipe_version: recipe.version,
        pipeline: recipe.name.clone(),
        generated_at: Utc::now(),
        inputs,
        parameters_hash: hash_bytes(&serde_json::to_vec(&parameters)?),
        output: OutputLock {
            directory: recipe.output.directory.to_string_lossy().to_string(),
        },
        steps: recipe
            .steps
            .iter()
            .map(|spec| StepLock {
                name: spec.display_name().to_string(),
                handler: spec.step.clone(),
                params_hash: hash_step(spec),
            })
            .collect(),
        execution_order: graph
            .execution_order()
            .into_iter()
            .map(str::to_string)
            .collect(),
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

/// Covers the handler, its parameters and its artifact bindings.
fn hash_step(spec: &StepSpec) -> String {
    let value = serde_json::json!({
        "step": spec.step,
        "params": spec.params.clone().unwrap_or_default(),
        "inputs": spec.inputs,
        "outputs": spec.outputs,
    });
    hash_bytes(&serde_json::to_vec(&value).unwrap_or_default())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
