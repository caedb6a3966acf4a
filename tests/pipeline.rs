use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use spaceflights::artifacts::{
    ArtifactRef, ArtifactStore, ArtifactValue, FileArtifactStore, compute_sha256,
};
use spaceflights::graph::{GraphBuilder, StepDefinition};
use spaceflights::params::RunParameters;
use spaceflights::pipeline::{
    FnStep, OutputSpec, PipelineExecutor, StepOutputs, StepStatus, build_graph, build_pipeline,
};
use spaceflights::presets::{DEFAULT_FEATURES, preset_recipe};
use spaceflights::recipe::Recipe;
use spaceflights::registry::{FileModelRegistry, MemoryModelRegistry, ModelRegistry};
use spaceflights::scheduler::SchedulePolicy;
use spaceflights::serving::MemoryServing;
use spaceflights::steps::default_registry;
use tempfile::tempdir;

fn data_inputs() -> BTreeMap<String, PathBuf> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("data");
    ["companies", "shuttles", "reviews"]
        .into_iter()
        .map(|name| (name.to_string(), root.join(format!("{name}.csv"))))
        .collect()
}

fn parameters() -> RunParameters {
    RunParameters {
        features: DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect(),
        test_size: 0.2,
        random_state: 3,
    }
}

fn spaceflights_executor() -> PipelineExecutor {
    let recipe = preset_recipe("spaceflights").unwrap();
    let registry = default_registry();
    let graph = build_graph(&registry, &recipe.name, recipe.inputs.keys(), &recipe.steps).unwrap();
    PipelineExecutor::new(graph, parameters())
}

#[test]
fn spaceflights_runs_end_to_end_in_memory() {
    let models = Arc::new(MemoryModelRegistry::new());
    let serving = Arc::new(MemoryServing::new());
    let executor = spaceflights_executor()
        .with_registry(models.clone())
        .with_serving(serving.clone());

    let report = executor.execute(&data_inputs()).expect("run report");
    assert!(report.succeeded(), "failed steps: {:?}", report.failed_steps());
    assert_eq!(report.steps.len(), 7);
    assert_eq!(report.steps.last().unwrap().step, "deploy");

    let x_test = executor
        .store()
        .get(report.artifact("X_test").unwrap())
        .unwrap();
    let test_rows = x_test.as_table().expect("X_test is a table").num_rows();
    assert!(test_rows > 0);

    let metrics = report.model_metrics.get("metrics").expect("metrics artifact");
    assert_eq!(metrics.n_samples, test_rows);
    assert!(metrics.r2.is_some_and(f64::is_finite));

    let endpoint = executor
        .store()
        .get(report.artifact("endpoint").unwrap())
        .unwrap();
    assert_eq!(endpoint.as_endpoint(), report.endpoints.first());

    let model = report.artifact("model").expect("model reference");
    let record = models.record_for(model).expect("model registered");
    assert!(record.metrics.contains_key("r2"));

    let deployments = serving.deployments();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].key, "regressor");
    assert_eq!(deployments[0].model_path, model.uri);
    assert_eq!(report.endpoints[0].url, "memory://serving/regressor");
}

#[test]
fn file_backed_run_persists_artifacts_registry_and_manifest() {
    let temp = tempdir().unwrap();
    let mut recipe: Recipe = preset_recipe("spaceflights").unwrap();
    recipe.inputs = data_inputs();
    recipe.parameters = spaceflights::params::ParametersSource::File(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("conf/parameters.yml"),
    );
    recipe.output = OutputSpec {
        directory: temp.path().join("out"),
    };

    let executor = build_pipeline(&default_registry(), &recipe, SchedulePolicy::Sequential)
        .expect("pipeline");
    let report = executor.execute(&recipe.inputs).expect("run report");
    assert!(report.succeeded(), "failed steps: {:?}", report.failed_steps());

    let model = report.artifact("model").unwrap();
    assert!(Path::new(&model.uri).starts_with(recipe.output.artifacts_dir()));

    let registry = FileModelRegistry::new(recipe.output.registry_dir()).unwrap();
    let record = registry.load("model").unwrap().expect("registry record");
    assert_eq!(record.digest, model.digest);
    assert!(record.metrics.contains_key("r2"));

    let manifest = fs::read_to_string(recipe.output.serving_dir().join("regressor.json")).unwrap();
    assert!(manifest.contains("\"function\": \"serving\""));
    assert!(manifest.contains("\"tracking\": true"));
    assert_eq!(report.endpoints[0].url, "local://serving/regressor");
}

/// File store whose copy of one artifact is overwritten right after it is written.
struct TamperingStore {
    inner: FileArtifactStore,
    target: &'static str,
}

impl ArtifactStore for TamperingStore {
    fn put(&self, name: &str, value: ArtifactValue) -> anyhow::Result<ArtifactRef> {
        let reference = self.inner.put(name, value)?;
        if name == self.target {
            fs::write(&reference.uri, b"{}")?;
        }
        Ok(reference)
    }

    fn get(&self, reference: &ArtifactRef) -> anyhow::Result<Arc<ArtifactValue>> {
        self.inner.get(reference)
    }
}

#[test]
fn evaluation_reads_model_back_from_the_store() {
    let temp = tempdir().unwrap();
    let store = FileArtifactStore::new(temp.path()).unwrap();
    let executor = spaceflights_executor().with_store(Arc::new(store.clone()));
    let report = executor.execute(&data_inputs()).unwrap();
    assert!(report.succeeded());

    let model = report.artifact("model").unwrap();
    assert!(Path::new(&model.uri).starts_with(store.root()));
    assert_eq!(compute_sha256(Path::new(&model.uri)).unwrap(), model.digest);
}

#[test]
fn consumers_of_a_corrupted_model_fail() {
    let temp = tempdir().unwrap();
    let store = TamperingStore {
        inner: FileArtifactStore::new(temp.path()).unwrap(),
        target: "model",
    };
    let report = spaceflights_executor()
        .with_store(Arc::new(store))
        .execute(&data_inputs())
        .unwrap();

    assert_eq!(report.step("train_model").unwrap().status, StepStatus::Succeeded);
    for consumer in ["evaluate_model", "deploy"] {
        assert!(
            matches!(
                &report.step(consumer).unwrap().status,
                StepStatus::Failed { error } if error.contains("does not match its recorded digest")
            ),
            "{consumer}: {:?}",
            report.step(consumer).unwrap().status
        );
    }
    assert!(report.model_metrics.is_empty());
}

#[test]
fn sequential_and_parallel_schedules_agree() {
    let sequential = spaceflights_executor()
        .with_schedule(SchedulePolicy::Sequential)
        .execute(&data_inputs())
        .unwrap();
    let parallel = spaceflights_executor()
        .with_schedule(SchedulePolicy::Parallel)
        .execute(&data_inputs())
        .unwrap();

    assert!(sequential.succeeded() && parallel.succeeded());
    let order = |report: &spaceflights::RunReport| {
        report
            .steps
            .iter()
            .map(|s| s.step.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(order(&sequential), order(&parallel));
    let digests = |report: &spaceflights::RunReport| {
        report
            .artifacts
            .iter()
            .filter(|(name, _)| name.as_str() != "endpoint")
            .map(|(name, r)| (name.clone(), r.digest.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    assert_eq!(digests(&sequential), digests(&parallel));
}

#[test]
fn missing_external_refuses_to_start() {
    let executor = spaceflights_executor();
    let mut inputs = data_inputs();
    inputs.remove("reviews");

    let err = executor.execute(&inputs).unwrap_err();
    assert!(err.to_string().contains("reviews"), "{err}");
    assert!(executor.metrics().snapshot().steps.is_empty());
}

#[test]
fn failing_step_skips_only_its_consumers() {
    let temp = tempdir().unwrap();
    let raw = temp.path().join("raw.csv");
    fs::write(&raw, "id,value\n1,10\n2,20\n").unwrap();

    let mut builder = GraphBuilder::new("branches");
    builder
        .external("raw")
        .declare_step(StepDefinition::new(
            "boom",
            Arc::new(FnStep::new("boom", &["raw"], &["bad"], |_, _| {
                Err(anyhow!("cannot parse"))
            })),
        ))
        .declare_step(StepDefinition::new(
            "after",
            Arc::new(FnStep::new("after", &["bad"], &["later"], |inputs, _| {
                Ok(StepOutputs::new().with("later", ArtifactValue::Table(inputs.table("bad")?.clone())))
            })),
        ))
        .declare_step(StepDefinition::new(
            "last",
            Arc::new(FnStep::new("last", &["later"], &["final"], |inputs, _| {
                Ok(StepOutputs::new().with("final", ArtifactValue::Table(inputs.table("later")?.clone())))
            })),
        ))
        .declare_step(StepDefinition::new(
            "sibling",
            Arc::new(FnStep::new("sibling", &["raw"], &["copy"], |inputs, _| {
                Ok(StepOutputs::new().with("copy", ArtifactValue::Table(inputs.table("raw")?.clone())))
            })),
        ));
    let graph = builder.build().unwrap();

    for policy in [SchedulePolicy::Sequential, SchedulePolicy::Parallel] {
        let executor = PipelineExecutor::new(graph_clone(&graph), parameters()).with_schedule(policy);
        let externals = BTreeMap::from([("raw".to_string(), raw.clone())]);
        let report = executor.execute(&externals).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.failed_steps(), vec!["boom"]);
        assert!(matches!(
            &report.step("boom").unwrap().status,
            StepStatus::Failed { error } if error.contains("cannot parse")
        ));
        for skipped in ["after", "last"] {
            assert_eq!(
                report.step(skipped).unwrap().status,
                StepStatus::Skipped {
                    blocked_by: "boom".into()
                }
            );
        }
        assert_eq!(report.step("sibling").unwrap().status, StepStatus::Succeeded);
        assert!(report.artifact("copy").is_some());
        assert!(report.artifact("final").is_none());

        let snapshot = executor.metrics().snapshot();
        assert_eq!(snapshot.steps_failed, 1);
        assert_eq!(snapshot.steps_skipped, 2);
        assert_eq!(snapshot.steps_succeeded, 1);
    }
}

#[test]
fn model_registry_records_metrics_against_model_artifact() {
    let models = Arc::new(MemoryModelRegistry::new());
    let report = spaceflights_executor()
        .with_registry(models.clone())
        .execute(&data_inputs())
        .unwrap();
    let model = report.artifact("model").unwrap();
    let record = models.record_for(model).unwrap();
    let metrics = report.model_metrics.get("metrics").unwrap();
    assert_eq!(record.metrics.get("r2").copied(), metrics.r2);

    // Saving the same artifact again keeps the reported metrics.
    let again = models.save_model("model", model).unwrap();
    assert_eq!(again.metrics, record.metrics);
}

fn graph_clone(graph: &spaceflights::Graph) -> spaceflights::Graph {
    let mut builder = GraphBuilder::new(graph.name());
    for external in graph.externals() {
        builder.external(external.clone());
    }
    for step in graph.steps() {
        builder.declare_step(step.clone());
    }
    builder.build().unwrap()
}
