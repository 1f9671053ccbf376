//! Error types for pipeline domain

use super::types::RunStatus;
use thiserror::Error;

/// Errors that can occur during engine and run operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Validation failed with specified reason
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A run is already active for this pipeline and the policy rejects overlap
    #[error("Pipeline '{pipeline}' already has an active run {active}")]
    RunRejected {
        /// Pipeline identity.
        pipeline: String,
        /// Identifier of the run that is still active.
        active: String,
    },

    /// No run with this identifier exists
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Run state machine violation
    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },

    /// The run reached a terminal status and can no longer change
    #[error("Run {0} is terminal and cannot be modified")]
    RunTerminal(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Validation errors for pipeline definitions
///
/// These are raised when an engine is built, before any run starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Name cannot be empty
    #[error("Name cannot be empty")]
    EmptyName,

    /// Name too long
    #[error("Name too long: max {max} characters, got {len}")]
    NameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length of the name.
        len: usize,
    },

    /// Invalid characters in name
    #[error("Invalid characters in name: '{name}'")]
    InvalidNameChars {
        /// The invalid name.
        name: String,
    },

    /// Pipeline must have at least one stage
    #[error("Pipeline must have at least one stage")]
    EmptyPipeline,

    /// Stage must have at least one step
    #[error("Stage '{stage}' must have at least one step")]
    EmptyStage {
        /// Name of the empty stage.
        stage: String,
    },

    /// Two stages share a name
    #[error("Duplicate stage name: '{stage}'")]
    DuplicateStage {
        /// The duplicated name.
        stage: String,
    },

    /// Two stages share a position in the execution order
    #[error("Stages '{first}' and '{second}' share position {position}")]
    DuplicatePosition {
        /// The contested position.
        position: u32,
        /// First stage declared at the position.
        first: String,
        /// Second stage declared at the position.
        second: String,
    },

    /// Some stages declare a position and others do not
    #[error("Stage '{stage}' has no position while other stages declare one")]
    MissingPosition {
        /// Stage without a position.
        stage: String,
    },

    /// Invalid timeout value
    #[error("Invalid timeout: must be positive, got {value}")]
    InvalidTimeout {
        /// The invalid timeout value.
        value: u64,
    },

    /// Invalid retry count
    #[error("Invalid retry count: must be positive, got {value}")]
    InvalidRetryCount {
        /// The invalid retry count.
        value: u32,
    },

    /// Invalid backoff configuration
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),

    /// A stage retries a step that must not run twice
    #[error("Stage '{stage}' retries non-idempotent step '{step}'")]
    NonIdempotentRetry {
        /// Stage name.
        stage: String,
        /// Step that cannot be retried.
        step: String,
    },

    /// A gated stage has no step that produces the verdict for its gate
    #[error("Stage '{stage}' is gated by '{gate}' but has no step producing that verdict")]
    GateWithoutVerdict {
        /// Stage name.
        stage: String,
        /// Gate kind.
        gate: String,
    },

    /// A step produces a verdict the stage does not gate on
    #[error("Step '{step}' in stage '{stage}' produces a {verdict} verdict but the stage is gated by '{gate}'")]
    UngatedVerdict {
        /// Stage name.
        stage: String,
        /// Verdict step.
        step: String,
        /// Gate the step's verdict is meant for.
        verdict: String,
        /// Gate the stage declares.
        gate: String,
    },

    /// A gated stage references a policy the pipeline does not define
    #[error("Stage '{stage}' is gated by '{gate}' but no such policy is configured")]
    MissingPolicy {
        /// Stage name.
        stage: String,
        /// Gate kind.
        gate: String,
    },

    /// A step consumes a reference that no earlier step produces
    #[error("Step '{step}' in stage '{stage}' needs {needs} from an earlier step")]
    MissingInput {
        /// Stage name.
        stage: String,
        /// Step kind.
        step: String,
        /// Missing input.
        needs: String,
    },

    /// A threshold cannot be evaluated as written
    #[error("Invalid threshold on '{metric}': {reason}")]
    InvalidThreshold {
        /// Metric name.
        metric: String,
        /// Why the threshold is unusable.
        reason: String,
    },

    /// A step argument is empty or malformed
    #[error("Invalid step '{step}': {reason}")]
    InvalidStep {
        /// Step kind.
        step: String,
        /// Why the step is unusable.
        reason: String,
    },

    /// Invalid schedule expression
    #[error("Invalid schedule expression: '{0}'")]
    InvalidSchedule(String),
}
