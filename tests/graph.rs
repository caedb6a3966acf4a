use std::path::Path;

use spaceflights::GraphError;
use spaceflights::pipeline::{StepSpec, build_graph};
use spaceflights::presets::preset_recipe;
use spaceflights::recipe::Recipe;
use spaceflights::steps::default_registry;

#[test]
fn spaceflights_graph_resolves_in_data_flow_order() {
    let recipe = preset_recipe("spaceflights").unwrap();
    let graph = build_graph(
        &default_registry(),
        &recipe.name,
        recipe.inputs.keys(),
        &recipe.steps,
    )
    .unwrap();

    assert_eq!(
        graph.execution_order(),
        vec![
            "preprocess_companies",
            "preprocess_shuttles",
            "create_model_input_table",
            "split_data",
            "train_model",
            "evaluate_model",
            "deploy",
        ]
    );
    assert_eq!(
        graph.levels(),
        vec![
            vec!["preprocess_companies", "preprocess_shuttles"],
            vec!["create_model_input_table"],
            vec!["split_data"],
            vec!["train_model"],
            vec!["evaluate_model", "deploy"],
        ]
    );
    assert_eq!(graph.producer("model"), Some("train_model"));
    assert_eq!(graph.producer("reviews"), None);
    assert_eq!(graph.upstream("evaluate_model"), vec!["split_data", "train_model"]);
    assert_eq!(
        graph.downstream("train_model"),
        vec!["evaluate_model", "deploy"]
    );
    assert!(graph.edges().iter().any(|edge| edge.from == "create_model_input_table"
        && edge.to == "split_data"
        && edge.artifact == "model_input_table"));
}

#[test]
fn declaration_order_does_not_change_resolution() {
    let recipe = preset_recipe("spaceflights").unwrap();
    let mut reversed = recipe.steps.clone();
    reversed.reverse();
    let registry = default_registry();
    let graph = build_graph(&registry, &recipe.name, recipe.inputs.keys(), &reversed).unwrap();
    let order = graph.execution_order();
    let position = |name: &str| order.iter().position(|s| *s == name).unwrap();
    assert!(position("preprocess_shuttles") < position("create_model_input_table"));
    assert!(position("train_model") < position("evaluate_model"));
    assert!(position("train_model") < position("deploy"));
}

#[test]
fn rebound_artifacts_flow_between_steps() {
    let recipe = Recipe::load(Path::new("recipes/training.yaml")).unwrap();
    let graph = build_graph(
        &default_registry(),
        &recipe.name,
        recipe.inputs.keys(),
        &recipe.steps,
    )
    .unwrap();
    assert_eq!(graph.producer("regressor"), Some("train_model"));
    assert_eq!(graph.producer("model"), None);
    assert_eq!(graph.upstream("evaluate_model"), vec!["split_data", "train_model"]);
}

#[test]
fn missing_external_input_is_unsatisfied() {
    let recipe = preset_recipe("spaceflights").unwrap();
    let externals: Vec<String> = vec!["companies".into(), "shuttles".into()];
    let err = build_graph(&default_registry(), &recipe.name, &externals, &recipe.steps)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::UnsatisfiedInput {
            step: "create_model_input_table".into(),
            input: "reviews".into(),
        })
    );
}

#[test]
fn same_step_twice_needs_distinct_names_and_outputs() {
    let recipe = preset_recipe("training").unwrap();
    let mut steps = recipe.steps.clone();
    steps.push(StepSpec::new("evaluate_model"));
    let err = build_graph(&default_registry(), &recipe.name, recipe.inputs.keys(), &steps)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::DuplicateStep {
            step: "evaluate_model".into()
        })
    );

    let mut renamed = StepSpec::new("evaluate_model");
    renamed.name = Some("evaluate_again".into());
    steps.pop();
    steps.push(renamed);
    let err = build_graph(&default_registry(), &recipe.name, recipe.inputs.keys(), &steps)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::DuplicateOutput { output, first, second })
            if output == "metrics" && first == "evaluate_model" && second == "evaluate_again"
    ));

    let mut rebound = StepSpec::new("evaluate_model");
    rebound.name = Some("evaluate_again".into());
    rebound
        .outputs
        .insert("metrics".into(), "metrics_again".into());
    steps.pop();
    steps.push(rebound);
    let graph = build_graph(&default_registry(), &recipe.name, recipe.inputs.keys(), &steps)
        .unwrap();
    assert_eq!(graph.len(), 7);
}

#[test]
fn unknown_step_is_reported_by_name() {
    let recipe = preset_recipe("training").unwrap();
    let mut steps = recipe.steps.clone();
    steps.push(StepSpec::new("tune_hyperparameters"));
    let err = build_graph(&default_registry(), &recipe.name, recipe.inputs.keys(), &steps)
        .unwrap_err();
    assert!(err.to_string().contains("tune_hyperparameters"), "{err}");
}

#[test]
fn empty_pipeline_is_rejected() {
    let err = build_graph(&default_registry(), "empty", std::iter::empty(), &[]).unwrap_err();
    assert_eq!(err.downcast_ref::<GraphError>(), Some(&GraphError::Empty));
}
