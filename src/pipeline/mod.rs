//! Pipeline domain types and logic

// Make submodules public
pub mod errors;
pub mod options;
pub mod pipeline_def;
pub mod run;
pub mod stage;
pub mod steps;
pub mod types;
pub mod verdict;


// Re-export public types from submodules
pub use errors::{PipelineError, ValidationError};
pub use options::{
    ConcurrencyPolicy, DEFAULT_STAGE_TIMEOUT_SECS, PollSchedule, RetryPolicy, TriggerCause,
};
pub use pipeline_def::{GatePolicies, Pipeline, PipelineBuilder};
pub use run::{AttemptRecord, Run, RunId, RunSummary, StageResult};
pub use stage::{GateKind, Stage, StageBuilder};
pub use steps::{Step, StepKind, StepOutput};
pub use types::{RunStatus, StageStatus, Validate};
pub use verdict::{Finding, GateVerdict};
