use anyhow::Result;
use tracing::{debug, info};

use super::{ensure_consumed, take_bool};
use crate::artifacts::ArtifactValue;
use crate::error::{StepError, TableError};
use crate::pipeline::{Step, StepContext, StepInputs, StepOutputs, StepParameters};
use crate::table::{Table, Value};

/// Company ratings arrive as "90%" and IATA approval as "t"/"f".
pub struct PreprocessCompanies;

impl PreprocessCompanies {
    pub fn from_params(params: StepParameters) -> Result<Self> {
        ensure_consumed(&params)?;
        Ok(Self)
    }

    pub fn apply(step: &str, companies: &Table) -> Result<Table, StepError> {
        let to_step = |err| StepError::from_table(step, err);
        let mut table = companies.clone();
        table
            .map_column("iata_approved", |row, value| parse_flag("iata_approved", row, value))
            .map_err(to_step)?;
        table
            .map_column("company_rating", |row, value| {
                parse_percentage("company_rating", row, value)
            })
            .map_err(to_step)?;
        Ok(table)
    }
}

impl Step for PreprocessCompanies {
    fn name(&self) -> &'static str {
        "preprocess_companies"
    }

    fn inputs(&self) -> &[&str] {
        &["companies"]
    }

    fn outputs(&self) -> &[&str] {
        &["preprocessed_companies"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let table = Self::apply(&ctx.step, inputs.table("companies")?)?;
        debug!(rows = table.num_rows(), "Companies preprocessed");
        Ok(StepOutputs::new().with("preprocessed_companies", ArtifactValue::Table(table)))
    }
}

/// Shuttle prices arrive as "$1,325.0"; check flags as "t"/"f".
pub struct PreprocessShuttles;

impl PreprocessShuttles {
    pub fn from_params(params: StepParameters) -> Result<Self> {
        ensure_consumed(&params)?;
        Ok(Self)
    }

    pub fn apply(step: &str, shuttles: &Table) -> Result<Table, StepError> {
        let to_step = |err| StepError::from_table(step, err);
        let mut table = shuttles.clone();
        for column in ["d_check_complete", "moon_clearance_complete"] {
            table
                .map_column(column, |row, value| parse_flag(column, row, value))
                .map_err(to_step)?;
        }
        table
            .map_column("price", |row, value| parse_money("price", row, value))
            .map_err(to_step)?;
        Ok(table)
    }
}

impl Step for PreprocessShuttles {
    fn name(&self) -> &'static str {
        "preprocess_shuttles"
    }

    fn inputs(&self) -> &[&str] {
        &["shuttles"]
    }

    fn outputs(&self) -> &[&str] {
        &["preprocessed_shuttles"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let table = Self::apply(&ctx.step, inputs.table("shuttles")?)?;
        debug!(rows = table.num_rows(), "Shuttles preprocessed");
        Ok(StepOutputs::new().with("preprocessed_shuttles", ArtifactValue::Table(table)))
    }
}

/// Joins shuttles with their reviews and operating companies.
pub struct CreateModelInputTable {
    drop_missing: bool,
}

impl CreateModelInputTable {
    pub fn from_params(mut params: StepParameters) -> Result<Self> {
        let drop_missing = take_bool(&mut params, "drop_missing")?.unwrap_or(true);
        ensure_consumed(&params)?;
        Ok(Self { drop_missing })
    }

    pub fn apply(
        &self,
        step: &str,
        shuttles: &Table,
        companies: &Table,
        reviews: &Table,
    ) -> Result<Table, StepError> {
        let to_step = |err| StepError::from_table(step, err);
        let mut rated = shuttles
            .inner_join(reviews, "id", "shuttle_id")
            .map_err(to_step)?;
        rated.drop_column("id").map_err(to_step)?;
        let joined = rated
            .inner_join(companies, "company_id", "id")
            .map_err(to_step)?;

        if !self.drop_missing {
            return Ok(joined);
        }
        let (table, dropped) = joined.drop_missing();
        if dropped > 0 {
            info!(
                dropped,
                kept = table.num_rows(),
                "Dropped rows with missing values from model input table"
            );
        }
        Ok(table)
    }
}

impl Step for CreateModelInputTable {
    fn name(&self) -> &'static str {
        "create_model_input_table"
    }

    fn inputs(&self) -> &[&str] {
        &["preprocessed_shuttles", "preprocessed_companies", "reviews"]
    }

    fn outputs(&self) -> &[&str] {
        &["model_input_table"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let table = self.apply(
            &ctx.step,
            inputs.table("preprocessed_shuttles")?,
            inputs.table("preprocessed_companies")?,
            inputs.table("reviews")?,
        )?;
        Ok(StepOutputs::new().with("model_input_table", ArtifactValue::Table(table)))
    }
}

/// "t" is true; any other text is false. Missing stays missing.
fn parse_flag(column: &str, row: usize, value: &Value) -> Result<Value, TableError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Text(text) => Ok(Value::Bool(text == "t")),
        other => Err(invalid(column, row, other)),
    }
}

/// "90%" becomes 0.9. Bare numbers are percentages too.
fn parse_percentage(column: &str, row: usize, value: &Value) -> Result<Value, TableError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int(v) => Ok(Value::Float(*v as f64 / 100.0)),
        Value::Float(v) => Ok(Value::Float(v / 100.0)),
        Value::Text(text) => text
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| Value::Float(v / 100.0))
            .ok_or_else(|| invalid(column, row, value)),
        other => Err(invalid(column, row, other)),
    }
}

/// "$1,325.0" becomes 1325.0.
fn parse_money(column: &str, row: usize, value: &Value) -> Result<Value, TableError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int(v) => Ok(Value::Float(*v as f64)),
        Value::Float(v) => Ok(Value::Float(*v)),
        Value::Text(text) => text
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Value::Float)
            .ok_or_else(|| invalid(column, row, value)),
        other => Err(invalid(column, row, other)),
    }
}

fn invalid(column: &str, row: usize, value: &Value) -> TableError {
    TableError::InvalidValue {
        column: column.to_string(),
        row,
        value: value.to_string(),
    }
}
