//! Step declarations and the dependency graph resolved from them.
//!
//! An edge runs from step A to step B whenever an artifact name bound to one
//! of A's outputs is also bound to one of B's inputs. Resolution happens once,
//! in [`GraphBuilder::build`]; a resolved [`Graph`] is always acyclic and every
//! input has exactly one source.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::GraphError;
use crate::pipeline::{Step, StepParameters};

const EXTERNAL: &str = "<external>";

/// Pairs a handler port with the artifact name used for edge matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub port: String,
    pub artifact: String,
}

impl Binding {
    fn identity(port: &str) -> Self {
        Self {
            port: port.to_string(),
            artifact: port.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<Binding>,
    pub params: StepParameters,
    step: Arc<dyn Step>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("handler", &self.step.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl StepDefinition {
    /// Declare a step whose artifacts are named after the handler's ports.
    pub fn new(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        let inputs = step.inputs().iter().map(|p| Binding::identity(p)).collect();
        let outputs = step.outputs().iter().map(|p| Binding::identity(p)).collect();
        Self {
            name: name.into(),
            inputs,
            outputs,
            params: StepParameters::new(),
            step,
        }
    }

    pub fn with_params(mut self, params: StepParameters) -> Self {
        self.params = params;
        self
    }

    pub fn bind_input(
        mut self,
        port: &str,
        artifact: impl Into<String>,
    ) -> Result<Self, GraphError> {
        let binding = self
            .inputs
            .iter_mut()
            .find(|b| b.port == port)
            .ok_or_else(|| GraphError::UnknownPort {
                step: self.name.clone(),
                direction: "input",
                port: port.to_string(),
            })?;
        binding.artifact = artifact.into();
        Ok(self)
    }

    pub fn bind_output(
        mut self,
        port: &str,
        artifact: impl Into<String>,
    ) -> Result<Self, GraphError> {
        let binding = self
            .outputs
            .iter_mut()
            .find(|b| b.port == port)
            .ok_or_else(|| GraphError::UnknownPort {
                step: self.name.clone(),
                direction: "output",
                port: port.to_string(),
            })?;
        binding.artifact = artifact.into();
        Ok(self)
    }

    pub fn handler(&self) -> &str {
        self.step.name()
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    pub fn input_artifacts(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|b| b.artifact.as_str())
    }

    pub fn output_artifacts(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|b| b.artifact.as_str())
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    name: String,
    externals: Vec<String>,
    steps: Vec<StepDefinition>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declare an artifact supplied from outside the graph, such as a raw table path.
    pub fn external(&mut self, artifact: impl Into<String>) -> &mut Self {
        let artifact = artifact.into();
        if !self.externals.contains(&artifact) {
            self.externals.push(artifact);
        }
        self
    }

    pub fn declare_step(&mut self, definition: StepDefinition) -> &mut Self {
        self.steps.push(definition);
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        if self.steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(GraphError::DuplicateStep {
                    step: step.name.clone(),
                });
            }
        }

        let mut sources: HashMap<&str, Option<usize>> = HashMap::new();
        for external in &self.externals {
            sources.insert(external.as_str(), None);
        }
        for (idx, step) in self.steps.iter().enumerate() {
            for artifact in step.output_artifacts() {
                if let Some(existing) = sources.insert(artifact, Some(idx)) {
                    let first = existing
                        .map(|i| self.steps[i].name.clone())
                        .unwrap_or_else(|| EXTERNAL.to_string());
                    return Err(GraphError::DuplicateOutput {
                        output: artifact.to_string(),
                        first,
                        second: step.name.clone(),
                    });
                }
            }
        }

        let mut dependencies = vec![BTreeSet::new(); self.steps.len()];
        for (idx, step) in self.steps.iter().enumerate() {
            for artifact in step.input_artifacts() {
                match sources.get(artifact) {
                    None => {
                        return Err(GraphError::UnsatisfiedInput {
                            step: step.name.clone(),
                            input: artifact.to_string(),
                        });
                    }
                    Some(Some(producer)) => {
                        dependencies[idx].insert(*producer);
                    }
                    Some(None) => {}
                }
            }
        }

        let producers = sources
            .into_iter()
            .filter_map(|(artifact, idx)| idx.map(|i| (artifact.to_string(), i)))
            .collect();

        let order = topological_order(&dependencies)
            .map_err(|remaining| cycle_error(&self.steps, &dependencies, &remaining))?;

        Ok(Graph {
            name: self.name,
            externals: self.externals.into_iter().collect(),
            steps: self.steps,
            producers,
            dependencies,
            order,
        })
    }
}

/// Kahn's algorithm. Among ready steps the earliest declared runs first, so a
/// fixed declaration order always yields the same sequence. On failure returns
/// the steps that could not be ordered.
fn topological_order(dependencies: &[BTreeSet<usize>]) -> Result<Vec<usize>, BTreeSet<usize>> {
    let n = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut dependents = vec![Vec::new(); n];
    for (idx, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &child in &dependents[next] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        let done: BTreeSet<usize> = order.into_iter().collect();
        Err((0..n).filter(|i| !done.contains(i)).collect())
    }
}

/// Every unordered step waits on another unordered step, so following
/// dependencies from any of them must revisit a step.
fn cycle_error(
    steps: &[StepDefinition],
    dependencies: &[BTreeSet<usize>],
    remaining: &BTreeSet<usize>,
) -> GraphError {
    let mut path: Vec<usize> = Vec::new();
    let mut current = remaining.first().copied();
    while let Some(node) = current {
        if let Some(pos) = path.iter().position(|&p| p == node) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .rev()
                .map(|&i| steps[i].name.clone())
                .collect();
            cycle.insert(0, steps[node].name.clone());
            return GraphError::Cycle { steps: cycle };
        }
        path.push(node);
        current = dependencies[node]
            .iter()
            .copied()
            .find(|dep| remaining.contains(dep));
    }
    GraphError::Cycle {
        steps: remaining.iter().map(|&i| steps[i].name.clone()).collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub artifact: String,
}

/// A resolved, acyclic step graph.
#[derive(Debug)]
pub struct Graph {
    name: String,
    steps: Vec<StepDefinition>,
    externals: BTreeSet<String>,
    producers: HashMap<String, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn externals(&self) -> &BTreeSet<String> {
        &self.externals
    }

    pub fn execution_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.steps[i].name.as_str())
            .collect()
    }

    pub fn ordered_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Name of the step producing `artifact`, or `None` for externals and unknown names.
    pub fn producer(&self, artifact: &str) -> Option<&str> {
        self.producers
            .get(artifact)
            .map(|&i| self.steps[i].name.as_str())
    }

    /// Direct dependencies of a step, in declaration order.
    pub fn upstream(&self, step: &str) -> Vec<&str> {
        self.index_of(step)
            .map(|idx| {
                self.dependencies[idx]
                    .iter()
                    .map(|&i| self.steps[i].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every step that transitively consumes an output of `step`, in execution order.
    pub fn downstream(&self, step: &str) -> Vec<&str> {
        let Some(root) = self.index_of(step) else {
            return Vec::new();
        };
        let mut reached = BTreeSet::from([root]);
        let mut result = Vec::new();
        for &idx in &self.order {
            if idx != root && self.dependencies[idx].iter().any(|d| reached.contains(d)) {
                reached.insert(idx);
                result.push(self.steps[idx].name.as_str());
            }
        }
        result
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for consumer in &self.steps {
            for binding in &consumer.inputs {
                if let Some(&producer) = self.producers.get(&binding.artifact) {
                    edges.push(Edge {
                        from: self.steps[producer].name.clone(),
                        to: consumer.name.clone(),
                        artifact: binding.artifact.clone(),
                    });
                }
            }
        }
        edges
    }

    /// Steps grouped by dependency depth. Steps within a level are independent.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.level_indices()
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .map(|i| self.steps[i].name.as_str())
                    .collect()
            })
            .collect()
    }

    pub(crate) fn level_indices(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.steps.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for &idx in &self.order {
            let level = self.dependencies[idx]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
            depth[idx] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(idx);
        }
        levels
    }

    pub(crate) fn step_at(&self, idx: usize) -> &StepDefinition {
        &self.steps[idx]
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    fn index_of(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == step)
    }
}
