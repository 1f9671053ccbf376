//! Stage execution layer
//!
//! This module runs stages against the tool adapters.

mod context;
mod stage_executor;

pub use context::RunContext;
pub use stage_executor::StageExecutor;
