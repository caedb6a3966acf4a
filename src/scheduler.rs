use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    /// One step at a time in topological order.
    #[default]
    Sequential,
    /// Independent steps of each dependency level run on the rayon pool.
    Parallel,
}

/// Decides which steps run together. Each wave only depends on earlier waves.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    policy: SchedulePolicy,
}

impl TaskScheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn waves(&self, graph: &Graph) -> Vec<Vec<usize>> {
        match self.policy {
            SchedulePolicy::Sequential => graph
                .order_indices()
                .iter()
                .map(|&idx| vec![idx])
                .collect(),
            SchedulePolicy::Parallel => graph
                .level_indices()
                .into_iter()
                .map(|mut level| {
                    level.sort_unstable();
                    level
                })
                .collect(),
        }
    }

    /// Runs `task` for every step in the wave. Results come back in wave order
    /// whatever order the tasks finished in.
    pub fn run_wave<T, F>(&self, wave: &[usize], task: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        match self.policy {
            SchedulePolicy::Sequential => wave.iter().map(|&idx| task(idx)).collect(),
            SchedulePolicy::Parallel => wave.par_iter().map(|&idx| task(idx)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::graph::{GraphBuilder, StepDefinition};
    use crate::pipeline::FnStep;

    fn step(name: &str, inputs: &[&'static str], outputs: &[&'static str]) -> StepDefinition {
        StepDefinition::new(
            name,
            Arc::new(FnStep::new("noop", inputs, outputs, |_, _| {
                Ok(Default::default())
            })),
        )
    }

    fn graph() -> Graph {
        let mut builder = GraphBuilder::new("waves");
        builder
            .external("raw")
            .declare_step(step("last", &["left"], &["out"]))
            .declare_step(step("left", &["raw"], &["left"]))
            .declare_step(step("right", &["raw"], &["right"]));
        builder.build().unwrap()
    }

    #[test]
    fn sequential_waves_follow_execution_order() {
        let waves = TaskScheduler::new(SchedulePolicy::Sequential).waves(&graph());
        assert_eq!(waves, vec![vec![1], vec![0], vec![2]]);
    }

    #[test]
    fn parallel_waves_group_independent_steps() {
        let scheduler = TaskScheduler::new(SchedulePolicy::Parallel);
        let waves = scheduler.waves(&graph());
        assert_eq!(waves, vec![vec![1, 2], vec![0]]);
        assert_eq!(scheduler.run_wave(&waves[0], |idx| idx * 10), vec![10, 20]);
    }
}
