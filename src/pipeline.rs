use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{Level, Span, error, info, instrument, warn};

use crate::artifacts::{
    ArtifactKind, ArtifactRef, ArtifactStore, ArtifactValue, FileArtifactStore,
    MemoryArtifactStore,
};
use crate::error::StepError;
use crate::evaluation::ModelMetrics;
use crate::graph::{Graph, GraphBuilder, StepDefinition};
use crate::model::LinearModel;
use crate::observability::MetricsCollector;
use crate::params::RunParameters;
use crate::recipe::Recipe;
use crate::registry::{FileModelRegistry, MemoryModelRegistry, ModelRegistry};
use crate::scheduler::{SchedulePolicy, TaskScheduler};
use crate::serving::{EndpointReference, ManifestServing, MemoryServing, ServingBackend};
use crate::table::Table;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
}

impl OutputSpec {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.directory.join("artifacts")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.directory.join("registry")
    }

    pub fn serving_dir(&self) -> PathBuf {
        self.directory.join("serving")
    }
}

pub type StepParameters = Map<String, Value>;

/// Per-invocation context. Steps see nothing else besides their inputs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step: String,
    pub parameters: Arc<RunParameters>,
}

/// A pure computation over named ports.
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;
    fn inputs(&self) -> &[&str];
    fn outputs(&self) -> &[&str];
    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs>;
}

#[derive(Debug, Clone)]
struct ResolvedInput {
    reference: ArtifactRef,
    value: Arc<ArtifactValue>,
}

/// Input values keyed by port name.
#[derive(Debug, Clone)]
pub struct StepInputs {
    step: String,
    values: BTreeMap<String, ResolvedInput>,
}

impl StepInputs {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        port: impl Into<String>,
        reference: ArtifactRef,
        value: Arc<ArtifactValue>,
    ) {
        self.values
            .insert(port.into(), ResolvedInput { reference, value });
    }

    /// Store `value` and bind it to `port`. Handy when invoking a step directly.
    pub fn stage(
        &mut self,
        store: &dyn ArtifactStore,
        port: &str,
        value: ArtifactValue,
    ) -> Result<ArtifactRef> {
        let reference = store.put(port, value)?;
        let value = store.get(&reference)?;
        self.insert(port, reference.clone(), value);
        Ok(reference)
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn references(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.values.values().map(|v| &v.reference)
    }

    pub fn value(&self, port: &str) -> Result<&ArtifactValue, StepError> {
        self.values
            .get(port)
            .map(|v| v.value.as_ref())
            .ok_or_else(|| StepError::MissingInput {
                step: self.step.clone(),
                port: port.to_string(),
            })
    }

    pub fn reference(&self, port: &str) -> Result<&ArtifactRef, StepError> {
        self.values
            .get(port)
            .map(|v| &v.reference)
            .ok_or_else(|| StepError::MissingInput {
                step: self.step.clone(),
                port: port.to_string(),
            })
    }

    pub fn table(&self, port: &str) -> Result<&Table, StepError> {
        let value = self.value(port)?;
        value
            .as_table()
            .ok_or_else(|| self.unexpected(port, ArtifactKind::Table, value))
    }

    pub fn model(&self, port: &str) -> Result<&LinearModel, StepError> {
        let value = self.value(port)?;
        value
            .as_model()
            .ok_or_else(|| self.unexpected(port, ArtifactKind::Model, value))
    }

    fn unexpected(&self, port: &str, expected: ArtifactKind, found: &ArtifactValue) -> StepError {
        StepError::UnexpectedArtifact {
            step: self.step.clone(),
            port: port.to_string(),
            expected: expected.as_str(),
            found: found.kind().as_str(),
        }
    }
}

/// Output values keyed by port name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutputs {
    values: BTreeMap<String, ArtifactValue>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, port: impl Into<String>, value: ArtifactValue) -> Self {
        self.values.insert(port.into(), value);
        self
    }

    pub fn get(&self, port: &str) -> Option<&ArtifactValue> {
        self.values.get(port)
    }

    pub fn take(&mut self, port: &str) -> Option<ArtifactValue> {
        self.values.remove(port)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Adapts a closure into a [`Step`] with fixed ports.
pub struct FnStep<F> {
    name: &'static str,
    inputs: Vec<&'static str>,
    outputs: Vec<&'static str>,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&StepInputs, &StepContext) -> Result<StepOutputs> + Send + Sync,
{
    pub fn new(
        name: &'static str,
        inputs: &[&'static str],
        outputs: &[&'static str],
        func: F,
    ) -> Self {
        Self {
            name,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            func,
        }
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(&StepInputs, &StepContext) -> Result<StepOutputs> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> &[&str] {
        &self.inputs
    }

    fn outputs(&self) -> &[&str] {
        &self.outputs
    }

    fn run(&self, inputs: &StepInputs, ctx: &StepContext) -> Result<StepOutputs> {
        (self.func)(inputs, ctx)
    }
}

type StepConstructor = Arc<dyn Fn(StepParameters) -> Result<Arc<dyn Step>> + Send + Sync>;

pub struct StepRegistry {
    factories: HashMap<String, StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StepParameters) -> Result<Arc<dyn Step>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StepParameters) -> Result<Arc<dyn Step>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown step '{}'. Available steps: {}",
                name,
                self.known_steps().join(", ")
            )
        })?;
        factory(params).with_context(|| format!("Invalid parameters for step '{name}'"))
    }

    pub fn known_steps(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StepParameters>,
}

impl StepSpec {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            name: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            params: None,
        }
    }

    /// Declared step name, falling back to the handler name.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { error: String },
    Skipped { blocked_by: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub handler: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub duration_ms: f64,
    pub outputs: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub schedule: SchedulePolicy,
    pub steps: Vec<StepReport>,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub model_metrics: BTreeMap<String, ModelMetrics>,
    pub endpoints: Vec<EndpointReference>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Succeeded))
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed { .. }))
            .map(|s| s.step.as_str())
            .collect()
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactRef> {
        self.artifacts.get(name)
    }
}

#[derive(Debug, Default)]
struct StepProducts {
    references: Vec<ArtifactRef>,
    metrics: Vec<(String, ModelMetrics)>,
    endpoints: Vec<EndpointReference>,
}

struct StepOutcome {
    result: Result<StepProducts>,
    duration_ms: f64,
}

/// Runs one resolved graph against injected collaborators.
pub struct PipelineExecutor {
    graph: Graph,
    parameters: Arc<RunParameters>,
    store: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ModelRegistry>,
    serving: Arc<dyn ServingBackend>,
    metrics: MetricsCollector,
    scheduler: TaskScheduler,
}

impl PipelineExecutor {
    pub fn new(graph: Graph, parameters: RunParameters) -> Self {
        Self {
            graph,
            parameters: Arc::new(parameters),
            store: Arc::new(MemoryArtifactStore::new()),
            registry: Arc::new(MemoryModelRegistry::new()),
            serving: Arc::new(MemoryServing::new()),
            metrics: MetricsCollector::new(),
            scheduler: TaskScheduler::new(SchedulePolicy::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_serving(mut self, serving: Arc<dyn ServingBackend>) -> Self {
        self.serving = serving;
        self
    }

    pub fn with_schedule(mut self, policy: SchedulePolicy) -> Self {
        self.scheduler = TaskScheduler::new(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn parameters(&self) -> &RunParameters {
        &self.parameters
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Execute every step once. A failing step only stops the steps that
    /// consume its outputs; independent branches still run. Missing external
    /// inputs refuse the run before any step starts.
    #[instrument(skip(self, externals), fields(pipeline = self.graph.name()))]
    pub fn execute(&self, externals: &BTreeMap<String, PathBuf>) -> Result<RunReport> {
        self.metrics.reset();
        let started_at = Utc::now();
        let total_start = Instant::now();

        let mut references = self.load_externals(externals)?;
        let mut blocked: HashMap<String, String> = HashMap::new();
        let mut reports: HashMap<usize, StepReport> = HashMap::new();
        let mut model_metrics = BTreeMap::new();
        let mut endpoints = Vec::new();
        let run_span = Span::current();

        for wave in self.scheduler.waves(&self.graph) {
            let mut runnable = Vec::with_capacity(wave.len());
            for idx in wave {
                let definition = self.graph.step_at(idx);
                let origin = definition
                    .input_artifacts()
                    .find_map(|artifact| blocked.get(artifact).cloned());
                match origin {
                    Some(blocked_by) => {
                        warn!(step = %definition.name, blocked_by = %blocked_by, "Skipping step");
                        for artifact in definition.output_artifacts() {
                            blocked.insert(artifact.to_string(), blocked_by.clone());
                        }
                        let status = StepStatus::Skipped { blocked_by };
                        self.metrics.record_step_status(&definition.name, &status);
                        reports.insert(idx, step_report(definition, status, 0.0, Vec::new()));
                    }
                    None => runnable.push(idx),
                }
            }

            let outcomes = self.scheduler.run_wave(&runnable, |idx| {
                let span = tracing::span!(
                    parent: &run_span,
                    Level::DEBUG,
                    "step",
                    step = self.graph.step_at(idx).name.as_str()
                );
                let _guard = span.enter();
                let start = Instant::now();
                let result = self.run_step(idx, &references);
                StepOutcome {
                    result,
                    duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
                }
            });

            for (idx, outcome) in runnable.into_iter().zip(outcomes) {
                let definition = self.graph.step_at(idx);
                let (status, outputs) = match outcome.result {
                    Ok(products) => {
                        info!(
                            step = %definition.name,
                            duration_ms = outcome.duration_ms,
                            outputs = products.references.len(),
                            "Step completed"
                        );
                        for reference in &products.references {
                            references.insert(reference.name.clone(), reference.clone());
                        }
                        for (artifact, metrics) in products.metrics {
                            for (metric, value) in metrics.entries() {
                                self.metrics.record_model_metric(&artifact, metric, value);
                            }
                            model_metrics.insert(artifact, metrics);
                        }
                        endpoints.extend(products.endpoints);
                        (StepStatus::Succeeded, products.references)
                    }
                    Err(err) => {
                        error!(step = %definition.name, error = %format!("{err:#}"), "Step failed");
                        for artifact in definition.output_artifacts() {
                            blocked.insert(artifact.to_string(), definition.name.clone());
                        }
                        (
                            StepStatus::Failed {
                                error: format!("{err:#}"),
                            },
                            Vec::new(),
                        )
                    }
                };
                self.metrics.record_step_status(&definition.name, &status);
                reports.insert(
                    idx,
                    step_report(definition, status, outcome.duration_ms, outputs),
                );
            }
        }

        let total = total_start.elapsed();
        self.metrics.record_total_duration(total);

        let steps = self
            .graph
            .order_indices()
            .iter()
            .filter_map(|idx| reports.remove(idx))
            .collect();

        Ok(RunReport {
            pipeline: self.graph.name().to_string(),
            started_at,
            duration_ms: total.as_secs_f64() * 1_000.0,
            schedule: self.scheduler.policy(),
            steps,
            artifacts: references.into_iter().collect(),
            model_metrics,
            endpoints,
        })
    }

    fn load_externals(
        &self,
        externals: &BTreeMap<String, PathBuf>,
    ) -> Result<HashMap<String, ArtifactRef>> {
        let missing: Vec<&str> = self
            .graph
            .externals()
            .iter()
            .filter(|name| !externals.get(*name).is_some_and(|p| p.is_file()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            bail!(
                "Pipeline '{}' cannot start, external inputs missing: {}",
                self.graph.name(),
                missing.join(", ")
            );
        }

        let mut references = HashMap::new();
        for name in self.graph.externals() {
            let Some(path) = externals.get(name) else {
                continue;
            };
            let table = Table::read_csv(path)?;
            info!(artifact = %name, path = %path.display(), rows = table.num_rows(), "Loaded external input");
            let reference = self
                .store
                .put(name, ArtifactValue::Table(table))
                .with_context(|| format!("Failed to store external input '{name}'"))?;
            references.insert(name.clone(), reference);
        }
        Ok(references)
    }

    fn run_step(
        &self,
        idx: usize,
        references: &HashMap<String, ArtifactRef>,
    ) -> Result<StepProducts> {
        let definition = self.graph.step_at(idx);
        let _timer = self.metrics.start_step(&definition.name);

        let mut inputs = StepInputs::new(&definition.name);
        for binding in &definition.inputs {
            let reference =
                references
                    .get(&binding.artifact)
                    .ok_or_else(|| StepError::MissingInput {
                        step: definition.name.clone(),
                        port: binding.port.clone(),
                    })?;
            let value = self.store.get(reference)?;
            inputs.insert(&binding.port, reference.clone(), value);
        }

        let ctx = StepContext {
            step: definition.name.clone(),
            parameters: self.parameters.clone(),
        };
        let mut outputs = definition.step().run(&inputs, &ctx)?;

        let mut products = StepProducts::default();
        for binding in &definition.outputs {
            let value = outputs
                .take(&binding.port)
                .ok_or_else(|| StepError::MissingOutput {
                    step: definition.name.clone(),
                    port: binding.port.clone(),
                })?;
            let value = match value {
                ArtifactValue::Deployment(request) => {
                    let endpoint = self.serving.deploy(&request).with_context(|| {
                        format!("Serving rejected deployment of '{}'", request.key)
                    })?;
                    products.endpoints.push(endpoint.clone());
                    ArtifactValue::Endpoint(endpoint)
                }
                other => other,
            };
            if let ArtifactValue::Table(table) = &value {
                info!(artifact = %binding.artifact, rows = table.num_rows(), columns = table.num_columns(), "Table produced");
            }
            let metrics = value.as_metrics().cloned();

            let reference = self.store.put(&binding.artifact, value)?;
            if reference.kind == ArtifactKind::Model {
                self.registry.save_model(&binding.artifact, &reference)?;
            }
            if let Some(metrics) = metrics {
                self.report_metrics(&inputs, &metrics)?;
                products.metrics.push((binding.artifact.clone(), metrics));
            }
            products.references.push(reference);
        }
        Ok(products)
    }

    fn report_metrics(&self, inputs: &StepInputs, metrics: &ModelMetrics) -> Result<()> {
        let Some(model) = inputs.references().find(|r| r.kind == ArtifactKind::Model) else {
            warn!(step = inputs.step(), "Metrics produced without a model input, not reported");
            return Ok(());
        };
        for (name, value) in metrics.entries() {
            self.registry.report_metric(model, name, value)?;
        }
        Ok(())
    }
}

fn step_report(
    definition: &StepDefinition,
    status: StepStatus,
    duration_ms: f64,
    outputs: Vec<ArtifactRef>,
) -> StepReport {
    StepReport {
        step: definition.name.clone(),
        handler: definition.handler().to_string(),
        status,
        duration_ms,
        outputs,
    }
}

/// Resolve recipe step declarations into a graph.
pub fn build_graph<'a>(
    registry: &StepRegistry,
    name: &str,
    externals: impl IntoIterator<Item = &'a String>,
    specs: &[StepSpec],
) -> Result<Graph> {
    let mut builder = GraphBuilder::new(name);
    for external in externals {
        builder.external(external.clone());
    }
    for spec in specs {
        let params = spec.params.clone().unwrap_or_default();
        let step = registry.create(&spec.step, params.clone())?;
        let mut definition = StepDefinition::new(spec.display_name(), step).with_params(params);
        for (port, artifact) in &spec.inputs {
            definition = definition.bind_input(port, artifact.clone())?;
        }
        for (port, artifact) in &spec.outputs {
            definition = definition.bind_output(port, artifact.clone())?;
        }
        builder.declare_step(definition);
    }
    Ok(builder.build()?)
}

/// Build an executor whose artifacts, registry records and serving manifests
/// live under the recipe's output directory.
pub fn build_pipeline(
    registry: &StepRegistry,
    recipe: &Recipe,
    policy: SchedulePolicy,
) -> Result<PipelineExecutor> {
    let parameters = recipe.parameters.resolve()?;
    let graph = build_graph(registry, &recipe.name, recipe.inputs.keys(), &recipe.steps)?;
    let output = &recipe.output;
    Ok(PipelineExecutor::new(graph, parameters)
        .with_schedule(policy)
        .with_store(Arc::new(FileArtifactStore::new(output.artifacts_dir())?))
        .with_registry(Arc::new(FileModelRegistry::new(output.registry_dir())?))
        .with_serving(Arc::new(
            ManifestServing::new(output.serving_dir(), recipe.serving_function())
                .with_tracking(recipe.serving_tracking()),
        )))
}
