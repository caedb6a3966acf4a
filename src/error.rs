use thiserror::Error;

/// Construction-time failures. Any of these prevents the run from starting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Pipeline has no steps")]
    Empty,
    #[error("Step '{step}' is declared more than once")]
    DuplicateStep { step: String },
    #[error("Output '{output}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        output: String,
        first: String,
        second: String,
    },
    #[error("Step '{step}' requires input '{input}' which no step or external source provides")]
    UnsatisfiedInput { step: String, input: String },
    #[error("Steps form a dependency cycle: {}", steps.join(" -> "))]
    Cycle { steps: Vec<String> },
    #[error("Step '{step}' has no {direction} port named '{port}'")]
    UnknownPort {
        step: String,
        direction: &'static str,
        port: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Run parameter '{0}' is required")]
    Missing(&'static str),
    #[error("Run parameter '{key}' is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Run parameters must be a mapping")]
    NotAMapping,
}

/// Run-time data failures. Fatal to the affected branch only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("Step '{step}': join keys are not comparable ({detail})")]
    JoinKeyMismatch { step: String, detail: String },
    #[error("Step '{step}': training set has no rows")]
    EmptyTrainingSet { step: String },
    #[error("Step '{step}': column '{column}' is missing")]
    MissingColumn { step: String, column: String },
    #[error("Step '{step}': value '{value}' in column '{column}' (row {row}) cannot be parsed")]
    InvalidValue {
        step: String,
        column: String,
        row: usize,
        value: String,
    },
    #[error("Step '{step}': column '{column}' has a non-numeric or missing value at row {row}")]
    NonNumeric {
        step: String,
        column: String,
        row: usize,
    },
    #[error("Step '{step}': input '{port}' was not supplied")]
    MissingInput { step: String, port: String },
    #[error("Step '{step}': input '{port}' should be a {expected} but is a {found}")]
    UnexpectedArtifact {
        step: String,
        port: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Step '{step}' did not produce declared output '{port}'")]
    MissingOutput { step: String, port: String },
    #[error("Step '{step}': {detail}")]
    Shape { step: String, detail: String },
}

/// Errors raised by table operations before a step name is attached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("column '{0}' is missing")]
    MissingColumn(String),
    #[error("row {row} has {found} cells but the table has {expected} columns")]
    Arity {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("join keys are not comparable ({0})")]
    KeyMismatch(String),
    #[error("value '{value}' in column '{column}' (row {row}) cannot be parsed")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error("column '{column}' has a non-numeric or missing value at row {row}")]
    NonNumeric { column: String, row: usize },
}

impl StepError {
    pub fn from_table(step: &str, err: TableError) -> Self {
        let step = step.to_string();
        match err {
            TableError::MissingColumn(column) => StepError::MissingColumn { step, column },
            TableError::KeyMismatch(detail) => StepError::JoinKeyMismatch { step, detail },
            TableError::InvalidValue { column, row, value } => StepError::InvalidValue {
                step,
                column,
                row,
                value,
            },
            TableError::NonNumeric { column, row } => StepError::NonNumeric { step, column, row },
            other @ TableError::Arity { .. } => StepError::Shape {
                step,
                detail: other.to_string(),
            },
        }
    }
}
