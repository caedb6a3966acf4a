pub mod artifacts;
pub mod error;
pub mod evaluation;
pub mod graph;
pub mod lockfile;
pub mod model;
pub mod observability;
pub mod params;
pub mod pipeline;
pub mod presets;
pub mod recipe;
pub mod registry;
pub mod scheduler;
pub mod serving;
pub mod steps;
pub mod table;
pub mod validation;

pub use error::{GraphError, ParameterError, StepError};
pub use graph::{Graph, GraphBuilder, StepDefinition};
pub use pipeline::{PipelineExecutor, RunReport, Step, StepRegistry};
pub use recipe::Recipe;
