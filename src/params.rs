use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::ParameterError;

/// Cross-cutting knobs every step may read. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub features: Vec<String>,
    pub test_size: f64,
    pub random_state: u64,
}

/// Where the recipe takes its parameters from: a YAML file or an inline mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParametersSource {
    File(std::path::PathBuf),
    Inline(Mapping),
}

impl ParametersSource {
    pub fn resolve(&self) -> Result<RunParameters> {
        match self {
            ParametersSource::Inline(mapping) => Ok(RunParameters::from_mapping(mapping)?),
            ParametersSource::File(path) => RunParameters::load(path),
        }
    }
}

impl RunParameters {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters file: {}", path.display()))?;
        let value: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse parameters YAML: {}", path.display()))?;
        let mapping = value.as_mapping().ok_or(ParameterError::NotAMapping)?;
        Self::from_mapping(mapping)
            .with_context(|| format!("Invalid parameters file: {}", path.display()))
    }

    /// Read the recognised keys; anything else in the mapping is ignored.
    pub fn from_mapping(mapping: &Mapping) -> Result<Self, ParameterError> {
        let features = match mapping.get("features") {
            None | Some(Value::Null) => return Err(ParameterError::Missing("features")),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ParameterError::Invalid {
                            key: "features",
                            reason: "every feature must be a column name".into(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ParameterError::Invalid {
                    key: "features",
                    reason: "expected a list of column names".into(),
                });
            }
        };

        let test_size = match mapping.get("test_size") {
            None | Some(Value::Null) => return Err(ParameterError::Missing("test_size")),
            Some(value) => value.as_f64().ok_or_else(|| ParameterError::Invalid {
                key: "test_size",
                reason: "expected a number".into(),
            })?,
        };

        let random_state = match mapping.get("random_state") {
            None | Some(Value::Null) => return Err(ParameterError::Missing("random_state")),
            Some(value) => value.as_u64().ok_or_else(|| ParameterError::Invalid {
                key: "random_state",
                reason: "expected a non-negative integer".into(),
            })?,
        };

        let params = Self {
            features,
            test_size,
            random_state,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.features.is_empty() {
            return Err(ParameterError::Invalid {
                key: "features",
                reason: "at least one feature is required".into(),
            });
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(ParameterError::Invalid {
                key: "test_size",
                reason: format!("{} is not inside (0, 1)", self.test_size),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let params = RunParameters::from_mapping(&mapping(
            "features: [engines, crew]\ntest_size: 0.2\nrandom_state: 3\nmodel: fancy\n",
        ))
        .unwrap();
        assert_eq!(params.features, vec!["engines", "crew"]);
        assert_eq!(params.random_state, 3);
    }

    #[test]
    fn missing_key_is_named() {
        let err = RunParameters::from_mapping(&mapping("features: [a]\ntest_size: 0.2\n"))
            .unwrap_err();
        assert_eq!(err, ParameterError::Missing("random_state"));
    }

    #[test]
    fn test_size_must_be_a_fraction() {
        for bad in ["0", "1", "1.5", "-0.1"] {
            let yaml = format!("features: [a]\ntest_size: {bad}\nrandom_state: 1\n");
            let err = RunParameters::from_mapping(&mapping(&yaml)).unwrap_err();
            assert!(matches!(err, ParameterError::Invalid { key: "test_size", .. }));
        }
    }

    #[test]
    fn inline_and_file_sources_agree() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("parameters.yml");
        std::fs::write(&path, "features: [a, b]\ntest_size: 0.25\nrandom_state: 7\n").unwrap();

        let from_file = ParametersSource::File(path).resolve().unwrap();
        let inline = ParametersSource::Inline(mapping(
            "features: [a, b]\ntest_size: 0.25\nrandom_state: 7\n",
        ))
        .resolve()
        .unwrap();
        assert_eq!(from_file, inline);
    }
}
