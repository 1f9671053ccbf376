//! # Stagegate - gated build-to-deploy pipelines
//!
//! Stagegate drives a fixed sequence of stages (build, tests, static
//! analysis, quality gate, image build, vulnerability scan, image push,
//! remote deploy) through external tools, and stops a run as soon as a stage
//! fails or a gate blocks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stagegate::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let tools = ToolAdapters::from_config(&config, config.credential_resolver())?;
//! let pipeline = Pipeline::reference("shop", "shop", "acme/shop", "10.0.0.5");
//!
//! let engine = PipelineEngine::new(pipeline, tools)?;
//! let run = engine
//!     .run_to_completion(TriggerCause::push("acme/shop", "main", "9f2c1e7"))
//!     .await?;
//! println!("{}", run.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Fail-fast stages**: the first stage that does not pass skips the rest
//! - **Fail-closed gates**: a missing verdict blocks, it never passes
//! - **Retry with backoff**: transient tool failures only
//! - **One run at a time**: overlapping triggers are rejected or queued
//! - **Guaranteed notification**: exactly once per run, on every exit path

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod engine;
pub mod executor;
pub mod gate;
pub mod infrastructure;
pub mod pipeline;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use engine::{PipelineEngine, PollTrigger, PushTrigger, TriggerSource};
pub use executor::{RunContext, StageExecutor};
pub use gate::{GateDecision, GateEvaluator, GatePolicy, Threshold};
pub use infrastructure::{
    AdapterError, Config, ExternalToolAdapter, MetricsCollector, PipelineMetrics, ToolAdapters,
};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineError, Run, RunId, RunStatus, Stage, StageBuilder,
    StageResult, StageStatus, Step, StepKind, TriggerCause, Validate, ValidationError,
};

/// Version of the stagegate crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
