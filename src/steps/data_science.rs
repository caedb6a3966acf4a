use anyhow::Result;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use super::{design_matrix, ensure_consumed, take_string, target_vector};
use crate::artifacts::ArtifactValue;
use crate::error::StepError;
use crate::evaluation::{ModelMetrics, compute_metrics};
use crate::model::LinearModel;
use crate::params::RunParameters;
use crate::pipeline::{Step, StepContext, StepInputs, StepOutputs, StepParameters};
use crate::table::Table;

const DEFAULT_TARGET: &str = "price";

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub x_train: Table,
    pub x_test: Table,
    pub y_train: Table,
    pub y_test: Table,
}

/// Seeded train/test partition of the model input table.
pub struct SplitData {
    target: String,
}

impl SplitData {
    pub fn from_params(mut params: StepParameters) -> Result<Self> {
        let target = take_string(&mut params, "target")?.unwrap_or_else(|| DEFAULT_TARGET.into());
        ensure_consumed(&params)?;
        Ok(Self { target })
    }

    pub fn apply(
        &self,
        step: &str,
        data: &Table,
        params: &RunParameters,
    ) -> Result<Split, StepError> {
        let to_step = |err| StepError::from_table(step, err);
        let features = data.select(&params.features).map_err(to_step)?;
        let target = data
            .select(std::slice::from_ref(&self.target))
            .map_err(to_step)?;

        let rows = data.num_rows();
        let n_test = test_rows(rows, params.test_size);
        let mut order: Vec<usize> = (0..rows).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(params.random_state);
        order.shuffle(&mut rng);
        let (test, train) = order.split_at(n_test);

        Ok(Split {
            x_train: features.take(train),
            x_test: features.take(test),
            y_train: target.take(train),
            y_test: target.take(test),
        })
    }
}

fn test_rows(rows: usize, test_size: f64) -> usize {
    let n_test = (test_size * rows as f64).ceil().max(0.0) as usize;
    n_test.min(rows)
}

impl Step for SplitData {
    fn name(&self) -> &'static str {
        "split_data"
    }

    fn inputs(&self) -> &[&str] {
        &["model_input_table"]
    }

    fn outputs(&self) -> &[&str] {
        &["X_train", "X_test", "y_train", "y_test"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let split = self.apply(
            &ctx.step,
            inputs.table("model_input_table")?,
            &ctx.parameters,
        )?;
        info!(
            train_rows = split.x_train.num_rows(),
            test_rows = split.x_test.num_rows(),
            seed = ctx.parameters.random_state,
            "Data split"
        );
        Ok(StepOutputs::new()
            .with("X_train", ArtifactValue::Table(split.x_train))
            .with("X_test", ArtifactValue::Table(split.x_test))
            .with("y_train", ArtifactValue::Table(split.y_train))
            .with("y_test", ArtifactValue::Table(split.y_test)))
    }
}

/// Least-squares regression on the training partition.
pub struct TrainModel;

impl TrainModel {
    pub fn from_params(params: StepParameters) -> Result<Self> {
        ensure_consumed(&params)?;
        Ok(Self)
    }

    pub fn apply(step: &str, x_train: &Table, y_train: &Table) -> Result<LinearModel, StepError> {
        if x_train.is_empty() {
            return Err(StepError::EmptyTrainingSet {
                step: step.to_string(),
            });
        }
        if x_train.num_rows() != y_train.num_rows() {
            return Err(StepError::Shape {
                step: step.to_string(),
                detail: format!(
                    "{} feature rows but {} target rows",
                    x_train.num_rows(),
                    y_train.num_rows()
                ),
            });
        }
        let features = x_train.columns().to_vec();
        let x = design_matrix(step, x_train, &features)?;
        let (target, y) = target_vector(step, y_train)?;
        LinearModel::fit(features, target, &x, &y).map_err(|err| StepError::Shape {
            step: step.to_string(),
            detail: err.to_string(),
        })
    }
}

impl Step for TrainModel {
    fn name(&self) -> &'static str {
        "train_model"
    }

    fn inputs(&self) -> &[&str] {
        &["X_train", "y_train"]
    }

    fn outputs(&self) -> &[&str] {
        &["model"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let model = Self::apply(&ctx.step, inputs.table("X_train")?, inputs.table("y_train")?)?;
        info!(
            samples = model.n_samples,
            features = model.features.len(),
            intercept = model.intercept,
            "Model trained"
        );
        Ok(StepOutputs::new().with("model", ArtifactValue::Model(model)))
    }
}

/// Scores a trained model on the held-out partition.
pub struct EvaluateModel;

impl EvaluateModel {
    pub fn from_params(params: StepParameters) -> Result<Self> {
        ensure_consumed(&params)?;
        Ok(Self)
    }

    pub fn apply(
        step: &str,
        model: &LinearModel,
        x_test: &Table,
        y_test: &Table,
    ) -> Result<ModelMetrics> {
        if x_test.num_rows() != y_test.num_rows() {
            return Err(StepError::Shape {
                step: step.to_string(),
                detail: format!(
                    "{} feature rows but {} target rows",
                    x_test.num_rows(),
                    y_test.num_rows()
                ),
            }
            .into());
        }
        let x = design_matrix(step, x_test, &model.features)?;
        let (_, y) = target_vector(step, y_test)?;
        let predicted = model.predict(&x).map_err(|err| StepError::Shape {
            step: step.to_string(),
            detail: err.to_string(),
        })?;
        compute_metrics(
            y.as_slice().unwrap_or_default(),
            predicted.as_slice().unwrap_or_default(),
        )
    }
}

impl Step for EvaluateModel {
    fn name(&self) -> &'static str {
        "evaluate_model"
    }

    fn inputs(&self) -> &[&str] {
        &["model", "X_test", "y_test"]
    }

    fn outputs(&self) -> &[&str] {
        &["metrics"]
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        let metrics = Self::apply(
            &ctx.step,
            inputs.model("model")?,
            inputs.table("X_test")?,
            inputs.table("y_test")?,
        )?;
        match metrics.r2 {
            Some(r2) => info!("Model has a coefficient R^2 of {r2:.3} on test data."),
            None => info!(
                samples = metrics.n_samples,
                "R^2 is undefined for fewer than two test samples"
            ),
        }
        Ok(StepOutputs::new().with("metrics", ArtifactValue::Metrics(metrics)))
    }
}
