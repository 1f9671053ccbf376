//! Pipeline definition and builder

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use crate::gate::GatePolicy;
use crate::pipeline::errors::{PipelineError, ValidationError};
use crate::pipeline::options::{ConcurrencyPolicy, PollSchedule, RetryPolicy};
use crate::pipeline::stage::{GateKind, Stage};
use crate::pipeline::steps::{StepKind, StepOutput};
use crate::pipeline::types::Validate;
use ahash::AHashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Maximum length of a pipeline name
pub const MAX_PIPELINE_NAME_LEN: usize = 64;

static PIPELINE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("pipeline name pattern is valid")
});

/// Gate policies of a pipeline, one per gate kind
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GatePolicies {
    /// Policy for static-analysis gates
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub quality: Option<GatePolicy>,

    /// Policy for vulnerability scan gates
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub security: Option<GatePolicy>,
}

impl GatePolicies {
    /// Built-in quality and security policies
    pub fn defaults() -> Self {
        Self {
            quality: Some(GatePolicy::default_quality()),
            security: Some(GatePolicy::default_security()),
        }
    }
}

/// Main pipeline structure
///
/// The pipeline name is its identity: at most one run per name is active at
/// a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Stages in pipeline
    pub stages: Vec<Stage>,

    /// Gate policies
    #[serde(default)]
    pub policies: GatePolicies,

    /// What to do with a trigger while a run is active
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,

    /// Poll schedule expression
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poll: Option<String>,
}

impl Validate for Pipeline {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.name.len() > MAX_PIPELINE_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                max: MAX_PIPELINE_NAME_LEN,
                len: self.name.len(),
            });
        }
        if !PIPELINE_NAME.is_match(&self.name) {
            return Err(ValidationError::InvalidNameChars {
                name: self.name.clone(),
            });
        }

        if self.stages.is_empty() {
            return Err(ValidationError::EmptyPipeline);
        }

        for stage in &self.stages {
            stage.validate()?;
        }

        let mut names = AHashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(ValidationError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
        }

        self.check_positions()?;
        self.check_inputs()?;

        for stage in self.stages.iter().filter(|s| s.gate.is_gated()) {
            let policy = self
                .policy_for(stage.gate)
                .ok_or_else(|| ValidationError::MissingPolicy {
                    stage: stage.name.clone(),
                    gate: stage.gate.to_string(),
                })?;
            policy.validate()?;
        }

        if let Some(expression) = &self.poll {
            PollSchedule::parse(expression)?;
        }

        Ok(())
    }
}

impl Pipeline {
    /// Creates a new pipeline builder
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Returns pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Policy configured for a gate kind
    pub fn policy_for(&self, gate: GateKind) -> Option<&GatePolicy> {
        match gate {
            GateKind::None => None,
            GateKind::Quality => self.policies.quality.as_ref(),
            GateKind::Security => self.policies.security.as_ref(),
        }
    }

    /// Parsed poll schedule, if any
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSchedule`] for a malformed expression.
    pub fn poll_schedule(&self) -> Result<Option<PollSchedule>, ValidationError> {
        self.poll.as_deref().map(PollSchedule::parse).transpose()
    }

    /// Stages in execution order
    ///
    /// Positioned stages are sorted by position; without positions the
    /// declaration order is used.
    pub fn execution_order(&self) -> Vec<&Stage> {
        let mut ordered: Vec<&Stage> = self.stages.iter().collect();
        if ordered.iter().all(|s| s.position.is_some()) {
            ordered.sort_by_key(|s| s.position);
        }
        ordered
    }

    /// Reorders stages by execution order and assigns 1-based positions
    pub fn normalize(mut self) -> Self {
        if self.stages.iter().all(|s| s.position.is_some()) {
            self.stages.sort_by_key(|s| s.position);
        }
        for (index, stage) in self.stages.iter_mut().enumerate() {
            stage.position = Some(u32::try_from(index + 1).unwrap_or(u32::MAX));
        }
        self
    }

    /// Parses a pipeline from YAML, validates it and normalizes its order
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for malformed YAML and
    /// [`PipelineError::Validation`] for an invalid definition.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        let pipeline: Self = serde_yaml::from_str(yaml)?;
        pipeline.validate()?;
        Ok(pipeline.normalize())
    }

    /// Loads a pipeline definition from a YAML file
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] when the file cannot be read, otherwise
    /// the errors of [`Pipeline::from_yaml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Serializes the pipeline as YAML
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The reference build-to-deploy pipeline
    ///
    /// Build, unit tests, static analysis, quality gate, image build,
    /// vulnerability scan, image push and remote deploy.
    pub fn reference(
        name: impl Into<String>,
        project_key: impl Into<String>,
        image: impl Into<String>,
        target_host: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let project_key = project_key.into();
        let image = image.into();

        PipelineBuilder::new()
            .name(name)
            .stage(Stage::single("Build", StepKind::Build).with_retry(RetryPolicy::attempts(2)))
            .stage(Stage::single("Unit Tests", StepKind::Test))
            .stage(Stage::single(
                "SonarQube Analysis",
                StepKind::analyze(project_key.clone()),
            ))
            .stage(
                Stage::single("Quality Gate", StepKind::quality_gate(project_key))
                    .with_gate(GateKind::Quality)
                    .with_timeout(Duration::from_secs(300)),
            )
            .stage(Stage::single(
                "Docker Build",
                StepKind::image_build(format!("{image}:{{run}}")),
            ))
            .stage(
                Stage::single("Trivy Scan", StepKind::vulnerability_scan())
                    .with_gate(GateKind::Security)
                    .with_retry(RetryPolicy::attempts(2)),
            )
            .stage(Stage::single("Push Image", StepKind::registry_push("registry")))
            .stage(Stage::single(
                "Deploy to EC2",
                StepKind::remote_deploy(target_host, "deploy-ssh"),
            ))
            .policies(GatePolicies::defaults())
            .build_unchecked()
            .normalize()
    }

    fn check_positions(&self) -> Result<(), ValidationError> {
        let declared = self.stages.iter().filter(|s| s.position.is_some()).count();
        if declared == 0 {
            return Ok(());
        }
        if let Some(stage) = self.stages.iter().find(|s| s.position.is_none()) {
            return Err(ValidationError::MissingPosition {
                stage: stage.name.clone(),
            });
        }

        let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
        for stage in &self.stages {
            let Some(position) = stage.position else {
                continue;
            };
            if let Some(first) = seen.insert(position, &stage.name) {
                return Err(ValidationError::DuplicatePosition {
                    position,
                    first: first.to_string(),
                    second: stage.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_inputs(&self) -> Result<(), ValidationError> {
        let mut available: AHashSet<StepOutput> = AHashSet::new();
        for stage in self.execution_order() {
            for step in &stage.steps {
                if let Some(needs) = step.kind.needs()
                    && !available.contains(&needs)
                {
                    return Err(ValidationError::MissingInput {
                        stage: stage.name.clone(),
                        step: step.display_name().to_string(),
                        needs: needs.to_string(),
                    });
                }
                if let Some(output) = step.kind.produces() {
                    available.insert(output);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({}): {} stages", self.name, self.stages.len())
    }
}

/// Builder for creating pipelines
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder
    pub fn new() -> Self {
        Self {
            pipeline: Pipeline {
                name: String::new(),
                stages: Vec::new(),
                policies: GatePolicies::default(),
                concurrency: ConcurrencyPolicy::default(),
                poll: None,
            },
        }
    }

    /// Sets pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.pipeline.name = name.into();
        self
    }

    /// Adds a stage to the pipeline
    pub fn stage(mut self, stage: Stage) -> Self {
        self.pipeline.stages.push(stage);
        self
    }

    /// Adds multiple stages to the pipeline
    pub fn stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.pipeline.stages.extend(stages);
        self
    }

    /// Sets all gate policies
    pub fn policies(mut self, policies: GatePolicies) -> Self {
        self.pipeline.policies = policies;
        self
    }

    /// Sets the quality gate policy
    pub fn quality_policy(mut self, policy: GatePolicy) -> Self {
        self.pipeline.policies.quality = Some(policy);
        self
    }

    /// Sets the security gate policy
    pub fn security_policy(mut self, policy: GatePolicy) -> Self {
        self.pipeline.policies.security = Some(policy);
        self
    }

    /// Sets the concurrency policy
    pub fn concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.pipeline.concurrency = concurrency;
        self
    }

    /// Sets the poll schedule
    pub fn poll(mut self, expression: impl Into<String>) -> Self {
        self.pipeline.poll = Some(expression.into());
        self
    }

    /// Builds the pipeline, validating it
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self) -> Result<Pipeline, ValidationError> {
        self.pipeline.validate()?;
        Ok(self.pipeline.normalize())
    }

    /// Builds the pipeline without validation (for internal use)
    #[must_use]
    pub fn build_unchecked(self) -> Pipeline {
        self.pipeline
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
