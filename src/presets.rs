use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Value};

use crate::params::ParametersSource;
use crate::pipeline::{OutputSpec, StepSpec};
use crate::recipe::{Recipe, ServingSpec};

pub const PRESETS: &[&str] = &["spaceflights", "training"];

/// Columns the spaceflights price model is trained on.
pub const DEFAULT_FEATURES: &[&str] = &[
    "engines",
    "passenger_capacity",
    "crew",
    "d_check_complete",
    "moon_clearance_complete",
    "iata_approved",
    "company_rating",
    "review_scores_rating",
];

pub fn preset_recipe(name: &str) -> Result<Recipe> {
    match name {
        "spaceflights" => Ok(spaceflights_preset()),
        "training" => Ok(training_preset()),
        other => bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let rendered = preset_recipe(name)?.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Full pipeline: preprocessing, training, evaluation and deployment.
fn spaceflights_preset() -> Recipe {
    let mut steps = training_steps();
    steps.push(step("deploy", &[("key", "regressor")]));
    Recipe {
        version: 1,
        name: "spaceflights".into(),
        inputs: default_inputs(),
        parameters: ParametersSource::File(PathBuf::from("conf/parameters.yml")),
        steps,
        output: OutputSpec {
            directory: PathBuf::from("out/spaceflights"),
        },
        serving: Some(ServingSpec {
            tracking: true,
            ..ServingSpec::default()
        }),
    }
}

/// Training and evaluation only, with parameters inline.
fn training_preset() -> Recipe {
    Recipe {
        version: 1,
        name: "spaceflights-training".into(),
        inputs: default_inputs(),
        parameters: ParametersSource::Inline(inline_parameters()),
        steps: training_steps(),
        output: OutputSpec {
            directory: PathBuf::from("out/training"),
        },
        serving: None,
    }
}

fn training_steps() -> Vec<StepSpec> {
    vec![
        step("preprocess_companies", &[]),
        step("preprocess_shuttles", &[]),
        step("create_model_input_table", &[]),
        step("split_data", &[("target", "price")]),
        step("train_model", &[]),
        step("evaluate_model", &[]),
    ]
}

fn default_inputs() -> BTreeMap<String, PathBuf> {
    ["companies", "shuttles", "reviews"]
        .into_iter()
        .map(|name| (name.to_string(), PathBuf::from(format!("data/{name}.csv"))))
        .collect()
}

fn inline_parameters() -> Mapping {
    let mut mapping = Mapping::new();
    mapping.insert(
        Value::from("features"),
        Value::Sequence(DEFAULT_FEATURES.iter().map(|f| Value::from(*f)).collect()),
    );
    mapping.insert(Value::from("test_size"), Value::from(0.2));
    mapping.insert(Value::from("random_state"), Value::from(3));
    mapping
}

fn step(handler: &str, params: &[(&str, &str)]) -> StepSpec {
    let mut spec = StepSpec::new(handler);
    if !params.is_empty() {
        spec.params = Some(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        );
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_preset_lists_alternatives() {
        let err = preset_recipe("nightly").unwrap_err();
        assert!(err.to_string().contains("spaceflights, training"));
    }

    #[test]
    fn training_preset_parameters_resolve() {
        let recipe = preset_recipe("training").unwrap();
        let params = recipe.parameters.resolve().unwrap();
        assert_eq!(params.features.len(), DEFAULT_FEATURES.len());
        assert_eq!(params.random_state, 3);
        assert!(recipe.steps.iter().all(|s| s.step != "deploy"));
    }
}
