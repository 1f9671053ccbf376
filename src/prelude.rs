//! Prelude module for common imports

// Pipeline definition and runs
pub use crate::pipeline::errors::{PipelineError, ValidationError};
pub use crate::pipeline::options::{ConcurrencyPolicy, PollSchedule, RetryPolicy, TriggerCause};
pub use crate::pipeline::pipeline_def::{GatePolicies, Pipeline, PipelineBuilder};
pub use crate::pipeline::run::{Run, RunId, RunSummary, StageResult};
pub use crate::pipeline::stage::{GateKind, Stage, StageBuilder};
pub use crate::pipeline::steps::{Step, StepKind};
pub use crate::pipeline::types::{RunStatus, StageStatus, Validate};
pub use crate::pipeline::verdict::{Finding, GateVerdict};

// Gates
pub use crate::gate::{GateDecision, GateEvaluator, GatePolicy, Threshold};

// Execution
pub use crate::engine::{PipelineEngine, PollTrigger, PushTrigger, TriggerSource};
pub use crate::executor::{RunContext, StageExecutor};
pub use crate::infrastructure::{AdapterError, Config, ExternalToolAdapter, ToolAdapters};
