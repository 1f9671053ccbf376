//! Stage types for pipeline definition
//!
//! This module defines stage types, their gating policy and their builder.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::Validate;
use super::errors::ValidationError;
use super::options::{DEFAULT_STAGE_TIMEOUT_SECS, RetryPolicy};
use super::steps::{Step, StepKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum length of a stage name
pub const MAX_STAGE_NAME_LEN: usize = 100;

static STAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.\-/()]*$").expect("stage name pattern is valid")
});

/// Gate applied to the verdict produced inside a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// No gate
    #[default]
    None,
    /// Static-analysis quality gate
    Quality,
    /// Vulnerability scan security gate
    Security,
}

impl GateKind {
    /// Returns true if the stage is gated
    pub fn is_gated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Quality => write!(f, "quality"),
            Self::Security => write!(f, "security"),
        }
    }
}

/// A stage in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name
    pub name: String,

    /// Explicit position in the execution order
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<u32>,

    /// Steps in this stage, run in order
    pub steps: Vec<Step>,

    /// Gate evaluated on the stage's verdict
    #[serde(default)]
    pub gate: GateKind,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Deadline for each adapter call, in seconds
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_secs: Option<u64>,
}

impl Validate for Stage {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        if self.name.len() > MAX_STAGE_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                max: MAX_STAGE_NAME_LEN,
                len: self.name.len(),
            });
        }

        if !STAGE_NAME.is_match(&self.name) {
            return Err(ValidationError::InvalidNameChars {
                name: self.name.clone(),
            });
        }

        if self.steps.is_empty() {
            return Err(ValidationError::EmptyStage {
                stage: self.name.clone(),
            });
        }

        for step in &self.steps {
            step.kind.validate()?;
        }

        if let Some(value) = self.timeout_secs
            && value == 0
        {
            return Err(ValidationError::InvalidTimeout { value });
        }

        self.retry.validate()?;

        if self.retry.max_attempts > 1
            && let Some(step) = self.steps.iter().find(|s| !s.kind.is_idempotent())
        {
            return Err(ValidationError::NonIdempotentRetry {
                stage: self.name.clone(),
                step: step.display_name().to_string(),
            });
        }

        if let Some((step, verdict)) = self
            .steps
            .iter()
            .find_map(|s| s.kind.verdict_for().filter(|g| *g != self.gate).map(|g| (s, g)))
        {
            return Err(ValidationError::UngatedVerdict {
                stage: self.name.clone(),
                step: step.display_name().to_string(),
                verdict: verdict.to_string(),
                gate: self.gate.to_string(),
            });
        }

        if self.gate.is_gated() && self.verdict_step().is_none() {
            return Err(ValidationError::GateWithoutVerdict {
                stage: self.name.clone(),
                gate: self.gate.to_string(),
            });
        }

        Ok(())
    }
}

impl Stage {
    /// Creates a new stage
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            position: None,
            steps,
            gate: GateKind::None,
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Creates a stage with a single step
    pub fn single(name: impl Into<String>, kind: StepKind) -> Self {
        Self::new(name, vec![Step::new(kind)])
    }

    /// Sets the position of this stage
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    /// Sets the gate for this stage
    pub fn with_gate(mut self, gate: GateKind) -> Self {
        self.gate = gate;
        self
    }

    /// Sets the retry policy for this stage
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call timeout for this stage
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Per-call deadline, falling back to `default_secs`
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }

    /// Per-call deadline with the built-in default
    pub fn effective_timeout(&self) -> Duration {
        self.timeout(DEFAULT_STAGE_TIMEOUT_SECS)
    }

    /// The step whose verdict this stage's gate evaluates
    pub fn verdict_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.kind.verdict_for() == Some(self.gate))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({}): {} steps", self.name, self.steps.len())?;
        if self.gate.is_gated() {
            write!(f, ", {} gate", self.gate)?;
        }
        Ok(())
    }
}

/// Builder for creating stages
pub struct StageBuilder {
    stage: Stage,
}

impl StageBuilder {
    /// Creates a new stage builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stage: Stage::new(name, Vec::new()),
        }
    }

    /// Adds a step to the stage
    pub fn step(mut self, kind: StepKind) -> Self {
        self.stage.steps.push(Step::new(kind));
        self
    }

    /// Adds a named step to the stage
    pub fn named_step(mut self, name: impl Into<String>, kind: StepKind) -> Self {
        self.stage.steps.push(Step::new(kind).with_name(name));
        self
    }

    /// Sets the position of the stage
    pub fn position(mut self, position: u32) -> Self {
        self.stage.position = Some(position);
        self
    }

    /// Sets the gate of the stage
    pub fn gate(mut self, gate: GateKind) -> Self {
        self.stage.gate = gate;
        self
    }

    /// Sets the retry policy of the stage
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.stage.retry = retry;
        self
    }

    /// Sets the per-call timeout of the stage
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.stage = self.stage.with_timeout(timeout);
        self
    }

    /// Builds the stage
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self) -> Result<Stage, ValidationError> {
        self.stage.validate()?;
        Ok(self.stage)
    }

    /// Builds the stage without validation (for internal use)
    #[must_use]
    pub fn build_unchecked(self) -> Stage {
        self.stage
    }
}
