use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::pipeline::{StepRegistry, StepSpec, build_graph};
use crate::recipe::Recipe;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &StepRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if recipe.inputs.is_empty() {
        report
            .errors
            .push("At least one external input is required".into());
    }
    for (name, path) in &recipe.inputs {
        if path.as_os_str().is_empty() {
            report
                .errors
                .push(format!("Input '{name}' has an empty path"));
        } else if !path.is_file() {
            report.warnings.push(format!(
                "Input '{name}' does not exist yet: {}",
                path.display()
            ));
        }
    }

    if recipe.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    if let Err(err) = recipe.parameters.resolve() {
        report
            .errors
            .push(format!("Invalid run parameters: {err:#}"));
    }

    if recipe.steps.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one step".into());
        return report;
    }

    let mut steps_ok = true;
    for (idx, spec) in recipe.steps.iter().enumerate() {
        let step_report = validate_step(spec, registry)
            .with_context(|| format!("Step {} ('{}')", idx + 1, spec.display_name()))
            .unwrap_or_else(|err| ValidationReport {
                errors: vec![format!("{err:#}")],
                warnings: vec![],
            });
        steps_ok &= step_report.is_ok();
        report.merge(step_report);
    }

    // Graph errors only make sense once every handler could be built.
    if steps_ok {
        match build_graph(registry, &recipe.name, recipe.inputs.keys(), &recipe.steps) {
            Ok(graph) => {
                let consumed: BTreeSet<&str> = graph
                    .steps()
                    .iter()
                    .flat_map(|s| s.input_artifacts())
                    .collect();
                for name in recipe.inputs.keys() {
                    if !consumed.contains(name.as_str()) {
                        report
                            .warnings
                            .push(format!("Input '{name}' is not consumed by any step"));
                    }
                }
            }
            Err(err) => report.errors.push(format!("{err:#}")),
        }
    }

    report
}

fn validate_step(spec: &StepSpec, registry: &StepRegistry) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    let params = spec.params.clone().unwrap_or_default();
    let step = registry.create(&spec.step, params)?;

    for port in spec.inputs.keys() {
        if !step.inputs().contains(&port.as_str()) {
            report.errors.push(format!(
                "Step '{}' has no input port '{port}' (ports: {})",
                spec.display_name(),
                step.inputs().join(", ")
            ));
        }
    }
    for port in spec.outputs.keys() {
        if !step.outputs().contains(&port.as_str()) {
            report.errors.push(format!(
                "Step '{}' has no output port '{port}' (ports: {})",
                spec.display_name(),
                step.outputs().join(", ")
            ));
        }
    }

    Ok(report)
}
