use anyhow::Result;
use tracing::info;

use super::{ensure_consumed, take_string};
use crate::artifacts::ArtifactValue;
use crate::pipeline::{Step, StepContext, StepInputs, StepOutputs, StepParameters};
use crate::serving::DeploymentRequest;

const DEFAULT_KEY: &str = "regressor";

/// Asks the serving component to expose the trained model under `key`.
///
/// The step only describes the deployment. The executor hands the request to
/// the configured serving backend and records the endpoint it returns.
pub struct Deploy {
    key: String,
}

impl Deploy {
    pub fn from_params(mut params: StepParameters) -> Result<Self> {
        let key = take_string(&mut params, "key")?.unwrap_or_else(|| DEFAULT_KEY.into());
        ensure_consumed(&params)?;
        Ok(Self { key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Step for Deploy {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn inputs(&self) -> &[&str] {
        &["model"]
    }

    fn outputs(&self) -> &[&str] {
        &["endpoint"]
    }

    fn run(&self, inputs: &StepInputs, _ctx: &StepContext) -> Result<StepOutputs> {
        // Fails early if the input is not a model.
        inputs.model("model")?;
        let reference = inputs.reference("model")?;
        let request = DeploymentRequest {
            key: self.key.clone(),
            model_path: reference.uri.clone(),
        };
        info!(key = %request.key, model_path = %request.model_path, "Deployment requested");
        Ok(StepOutputs::new().with("endpoint", ArtifactValue::Deployment(request)))
    }
}
