//! Runs and stage results
//!
//! A [`Run`] is one execution of a pipeline. Its stage results form an
//! append-only log: results are pushed once and never edited, and nothing
//! changes after the run reaches a terminal status.

#![allow(clippy::must_use_candidate)]

use super::errors::PipelineError;
use super::options::TriggerCause;
use super::types::{RunStatus, StageStatus};
use super::verdict::GateVerdict;
use crate::gate::GateDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PipelineError::RunNotFound(s.to_string()))
    }
}

/// A failed attempt kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt ended
    pub finished_at: DateTime<Utc>,
    /// Step that failed
    pub step: String,
    /// Why the attempt failed
    pub reason: String,
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub stage: String,

    /// Final status
    pub status: StageStatus,

    /// Number of attempts made (0 when skipped)
    pub attempts: u32,

    /// When the stage started
    pub started_at: DateTime<Utc>,

    /// When the stage ended
    pub finished_at: DateTime<Utc>,

    /// Captured output on success, the reason otherwise
    pub diagnostic: String,

    /// Raw verdict for gated stages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verdict: Option<GateVerdict>,

    /// Gate decision for gated stages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gate: Option<GateDecision>,

    /// Earlier failed attempts
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_attempts: Vec<AttemptRecord>,
}

impl StageResult {
    /// Creates a skipped result
    pub fn skipped(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            attempts: 0,
            started_at: now,
            finished_at: now,
            diagnostic: reason.into(),
            verdict: None,
            gate: None,
            failed_attempts: Vec::new(),
        }
    }

    /// Creates a failed result for a stage that ended without an outcome
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            attempts: 1,
            ..Self::skipped(stage, reason)
        }
    }

    /// Wall-clock duration of the stage
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.signed_duration_since(self.started_at)
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.status)?;
        if !self.status.is_passed() && !self.diagnostic.is_empty() {
            write!(f, " ({})", self.diagnostic)?;
        }
        Ok(())
    }
}

/// One execution of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    id: RunId,
    number: u64,
    pipeline: String,
    cause: TriggerCause,
    status: RunStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    current_stage: Option<usize>,
    stages: Vec<StageResult>,
}

impl Run {
    /// Creates a pending run
    pub fn new(number: u64, pipeline: impl Into<String>, cause: TriggerCause) -> Self {
        Self {
            id: RunId::new(),
            number,
            pipeline: pipeline.into(),
            cause,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            current_stage: None,
            stages: Vec::new(),
        }
    }

    /// Run identifier
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Monotonic run number within the pipeline
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Pipeline name
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// What started the run
    pub fn cause(&self) -> &TriggerCause {
        &self.cause
    }

    /// Current status
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Start time, once running
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Finish time, once terminal
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Index of the stage being executed
    pub fn current_stage(&self) -> Option<usize> {
        self.current_stage
    }

    /// Stage results in execution order
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Looks up a stage result by name
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Total duration, once terminal
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at.unwrap_or(self.created_at);
        self.finished_at.map(|end| end.signed_duration_since(start))
    }

    /// Moves the run to another status
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunTerminal`] when the run already ended and
    /// [`PipelineError::InvalidTransition`] for any other illegal move.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), PipelineError> {
        if self.status.is_terminal() {
            return Err(PipelineError::RunTerminal(self.id.to_string()));
        }
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            RunStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                self.current_stage = None;
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Marks the stage at `index` as the one being executed
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunTerminal`] once the run ended.
    pub fn enter_stage(&mut self, index: usize) -> Result<(), PipelineError> {
        if self.status.is_terminal() {
            return Err(PipelineError::RunTerminal(self.id.to_string()));
        }
        self.current_stage = Some(index);
        Ok(())
    }

    /// Appends a stage result to the log
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunTerminal`] once the run ended.
    pub fn append(&mut self, result: StageResult) -> Result<(), PipelineError> {
        if self.status.is_terminal() {
            return Err(PipelineError::RunTerminal(self.id.to_string()));
        }
        self.stages.push(result);
        Ok(())
    }

    /// Summary handed to the notifier
    pub fn summary(&self) -> RunSummary {
        let count = |status: StageStatus| self.stages.iter().filter(|s| s.status == status).count();
        let stopped_at = self
            .stages
            .iter()
            .find(|s| !s.status.is_passed() && !s.status.is_skipped())
            .map(|s| (s.stage.clone(), s.diagnostic.clone()));

        RunSummary {
            run_id: self.id,
            number: self.number,
            pipeline: self.pipeline.clone(),
            cause: self.cause.to_string(),
            status: self.status,
            passed: count(StageStatus::Passed),
            failed: count(StageStatus::Failed),
            blocked: count(StageStatus::Blocked),
            skipped: count(StageStatus::Skipped),
            failed_stage: stopped_at.as_ref().map(|(stage, _)| stage.clone()),
            reason: stopped_at.map(|(_, reason)| reason),
            duration_ms: self
                .duration()
                .and_then(|d| u64::try_from(d.num_milliseconds()).ok())
                .unwrap_or(0),
        }
    }
}

/// Condensed view of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: RunId,
    /// Run number
    pub number: u64,
    /// Pipeline name
    pub pipeline: String,
    /// Human-readable trigger cause
    pub cause: String,
    /// Final status
    pub status: RunStatus,
    /// Passed stages
    pub passed: usize,
    /// Failed stages
    pub failed: usize,
    /// Blocked stages
    pub blocked: usize,
    /// Skipped stages
    pub skipped: usize,
    /// Stage that stopped the run
    pub failed_stage: Option<String>,
    /// Why that stage stopped the run
    pub reason: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {} ({} passed, {} failed, {} blocked, {} skipped)",
            self.pipeline,
            self.number,
            self.status,
            self.passed,
            self.failed,
            self.blocked,
            self.skipped
        )?;
        if let (Some(stage), Some(reason)) = (&self.failed_stage, &self.reason) {
            write!(f, ": stage '{stage}' {reason}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(stage: &str) -> StageResult {
        let now = Utc::now();
        StageResult {
            stage: stage.to_string(),
            status: StageStatus::Passed,
            attempts: 1,
            started_at: now,
            finished_at: now,
            diagnostic: String::new(),
            verdict: None,
            gate: None,
            failed_attempts: Vec::new(),
        }
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new(1, "shop", TriggerCause::manual("ops"));
        assert_eq!(run.status(), RunStatus::Pending);

        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at().is_some());

        run.append(passed("Build")).unwrap();
        run.transition(RunStatus::Succeeded).unwrap();

        assert!(run.finished_at().is_some());
        assert_eq!(run.stages().len(), 1);
        assert!(run.duration().is_some());
    }

    #[test]
    fn test_run_is_immutable_once_terminal() {
        let mut run = Run::new(1, "shop", TriggerCause::manual("ops"));
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();

        assert!(matches!(
            run.append(passed("Build")),
            Err(PipelineError::RunTerminal(_))
        ));
        assert!(matches!(
            run.transition(RunStatus::Running),
            Err(PipelineError::RunTerminal(_))
        ));
        assert!(run.enter_stage(0).is_err());
    }

    #[test]
    fn test_run_rejects_invalid_transition() {
        let mut run = Run::new(1, "shop", TriggerCause::manual("ops"));
        assert!(matches!(
            run.transition(RunStatus::Succeeded),
            Err(PipelineError::InvalidTransition { .. })
        ));
        run.transition(RunStatus::Aborted).unwrap();
        assert_eq!(run.status(), RunStatus::Aborted);
    }

    #[test]
    fn test_summary_names_failed_stage() {
        let mut run = Run::new(7, "shop", TriggerCause::push("acme/shop", "main", "abc"));
        run.transition(RunStatus::Running).unwrap();
        run.append(passed("Build")).unwrap();
        let mut scan = passed("Trivy Scan");
        scan.status = StageStatus::Blocked;
        scan.diagnostic = "gate blocked: criticalCVEs is 1".to_string();
        run.append(scan).unwrap();
        run.append(StageResult::skipped("Deploy", "skipped")).unwrap();
        run.transition(RunStatus::Failed).unwrap();

        let summary = run.summary();
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed_stage.as_deref(), Some("Trivy Scan"));
        assert!(summary.to_string().contains("shop #7 FAILED"));
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }
}
