use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::params::ParametersSource;
use crate::pipeline::{OutputSpec, StepSpec};

/// Declarative description of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    #[serde(default = "default_name")]
    pub name: String,
    /// External tables keyed by the artifact name steps consume them as.
    pub inputs: BTreeMap<String, PathBuf>,
    pub parameters: ParametersSource,
    pub steps: Vec<StepSpec>,
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving: Option<ServingSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingSpec {
    #[serde(default = "default_function")]
    pub function: String,
    /// Ask the serving side to monitor requests and predictions.
    #[serde(default)]
    pub tracking: bool,
}

impl Default for ServingSpec {
    fn default() -> Self {
        Self {
            function: default_function(),
            tracking: false,
        }
    }
}

fn default_name() -> String {
    "spaceflights".to_string()
}

fn default_function() -> String {
    "serving".to_string()
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render recipe YAML")
    }

    pub fn serving_tracking(&self) -> bool {
        self.serving.as_ref().is_some_and(|s| s.tracking)
    }

    pub fn serving_function(&self) -> String {
        self.serving
            .as_ref()
            .map(|s| s.function.clone())
            .unwrap_or_else(default_function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParametersSource;

    const RECIPE: &str = r#"
version: 1
inputs:
  companies: data/companies.csv
  shuttles: data/shuttles.csv
  reviews: data/reviews.csv
parameters: conf/parameters.yml
steps:
  - step: preprocess_companies
  - step: deploy
    name: deploy_regressor
    params:
      key: regressor
output:
  directory: out
"#;

    #[test]
    fn parses_minimal_recipe() {
        let recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        assert_eq!(recipe.name, "spaceflights");
        assert_eq!(recipe.inputs.len(), 3);
        assert_eq!(
            recipe.parameters,
            ParametersSource::File(PathBuf::from("conf/parameters.yml"))
        );
        assert_eq!(recipe.steps[1].display_name(), "deploy_regressor");
        assert_eq!(recipe.steps[0].display_name(), "preprocess_companies");
        assert_eq!(recipe.serving_function(), "serving");
        assert!(!recipe.serving_tracking());
    }

    #[test]
    fn serving_tracking_is_opt_in() {
        let text = format!("{RECIPE}serving:\n  function: price-api\n  tracking: true\n");
        let recipe: Recipe = serde_yaml::from_str(&text).unwrap();
        assert_eq!(recipe.serving_function(), "price-api");
        assert!(recipe.serving_tracking());
    }

    #[test]
    fn inline_parameters_round_trip_through_yaml() {
        let mut recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        recipe.parameters = ParametersSource::Inline(
            serde_yaml::from_str("features: [engines]\ntest_size: 0.2\nrandom_state: 3\n")
                .unwrap(),
        );
        let rendered = recipe.to_yaml().unwrap();
        let parsed: Recipe = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, recipe);
        assert_eq!(parsed.parameters.resolve().unwrap().random_state, 3);
    }
}
