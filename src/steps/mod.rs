//! Built-in step handlers for the spaceflights pipeline.

use std::sync::Arc;

use anyhow::{Result, bail};
use ndarray::{Array1, Array2};
use serde_json::Value;

use crate::error::StepError;
use crate::pipeline::{StepParameters, StepRegistry};
use crate::table::Table;

pub mod data_processing;
pub mod data_science;
pub mod deployment;

pub use data_processing::{CreateModelInputTable, PreprocessCompanies, PreprocessShuttles};
pub use data_science::{EvaluateModel, SplitData, TrainModel};
pub use deployment::Deploy;

pub fn register_defaults(registry: &mut StepRegistry) {
    registry.register("preprocess_companies", |params| {
        Ok(Arc::new(PreprocessCompanies::from_params(params)?))
    });
    registry.register("preprocess_shuttles", |params| {
        Ok(Arc::new(PreprocessShuttles::from_params(params)?))
    });
    registry.register("create_model_input_table", |params| {
        Ok(Arc::new(CreateModelInputTable::from_params(params)?))
    });
    registry.register("split_data", |params| {
        Ok(Arc::new(SplitData::from_params(params)?))
    });
    registry.register("train_model", |params| {
        Ok(Arc::new(TrainModel::from_params(params)?))
    });
    registry.register("evaluate_model", |params| {
        Ok(Arc::new(EvaluateModel::from_params(params)?))
    });
    registry.register("deploy", |params| Ok(Arc::new(Deploy::from_params(params)?)));
}

pub fn default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_defaults(&mut registry);
    registry
}

fn take_string(params: &mut StepParameters, key: &str) -> Result<Option<String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s)),
        Some(other) => bail!("Parameter '{key}' must be a non-empty string, got {other}"),
    }
}

fn take_bool(params: &mut StepParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => bail!("Parameter '{key}' must be a boolean, got '{s}'"),
        },
        Some(other) => bail!("Parameter '{key}' must be a boolean, got {other}"),
    }
}

/// Reject parameters a handler does not understand.
fn ensure_consumed(params: &StepParameters) -> Result<()> {
    if !params.is_empty() {
        let keys: Vec<&str> = params.keys().map(String::as_str).collect();
        bail!("Unknown parameter(s): {}", keys.join(", "));
    }
    Ok(())
}

/// Numeric `rows x columns` matrix over the named columns, in the given order.
fn design_matrix(step: &str, table: &Table, columns: &[String]) -> Result<Array2<f64>, StepError> {
    let mut matrix = Array2::zeros((table.num_rows(), columns.len()));
    for (col, name) in columns.iter().enumerate() {
        let values = table
            .numeric_column(name)
            .map_err(|err| StepError::from_table(step, err))?;
        for (row, value) in values.into_iter().enumerate() {
            matrix[[row, col]] = value;
        }
    }
    Ok(matrix)
}

/// The single column of a target table.
fn target_vector(step: &str, table: &Table) -> Result<(String, Array1<f64>), StepError> {
    let [name] = table.columns() else {
        return Err(StepError::Shape {
            step: step.to_string(),
            detail: format!(
                "target table must have exactly one column, found {}",
                table.num_columns()
            ),
        });
    };
    let values = table
        .numeric_column(name)
        .map_err(|err| StepError::from_table(step, err))?;
    Ok((name.clone(), Array1::from(values)))
}
