//! Step types for pipeline execution
//!
//! A step is one call to an external tool adapter. Stages chain steps,
//! and steps hand references (artifacts, images) to the steps after them.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::Validate;
use super::errors::ValidationError;
use super::stage::GateKind;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_severities() -> Vec<String> {
    vec!["CRITICAL".to_string(), "HIGH".to_string()]
}

/// Types of steps available in pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "uses", rename_all = "snake_case")]
pub enum StepKind {
    /// Compile and package the source
    Build,

    /// Run static analysis through the build tool
    Analyze {
        /// Project key on the analysis server
        project_key: String,
    },

    /// Run the test suite and archive its report
    Test,

    /// Wait for the static-analysis quality verdict
    QualityGate {
        /// Project key on the analysis server
        project_key: String,
    },

    /// Build a container image from the artifact
    ImageBuild {
        /// Image tag; `{commit}`, `{branch}` and `{run}` are substituted
        tag: String,
    },

    /// Scan the built image for vulnerabilities
    VulnerabilityScan {
        /// Severities the scanner should report
        #[serde(default = "default_severities")]
        severities: Vec<String>,
    },

    /// Push the image to a registry
    RegistryPush {
        /// Name of the registry credential
        credential: String,
    },

    /// Deploy the image on a remote host
    RemoteDeploy {
        /// Host to deploy to
        target_host: String,
        /// Name of the remote-shell credential
        credential: String,
    },
}

/// References a step can produce or consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOutput {
    /// A packaged build artifact
    Artifact,
    /// A container image
    Image,
}

impl fmt::Display for StepOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact => write!(f, "an artifact"),
            Self::Image => write!(f, "an image"),
        }
    }
}

impl StepKind {
    /// Creates an analysis step
    pub fn analyze(project_key: impl Into<String>) -> Self {
        Self::Analyze {
            project_key: project_key.into(),
        }
    }

    /// Creates a quality gate step
    pub fn quality_gate(project_key: impl Into<String>) -> Self {
        Self::QualityGate {
            project_key: project_key.into(),
        }
    }

    /// Creates an image build step
    pub fn image_build(tag: impl Into<String>) -> Self {
        Self::ImageBuild { tag: tag.into() }
    }

    /// Creates a vulnerability scan step with the default severities
    pub fn vulnerability_scan() -> Self {
        Self::VulnerabilityScan {
            severities: default_severities(),
        }
    }

    /// Creates a registry push step
    pub fn registry_push(credential: impl Into<String>) -> Self {
        Self::RegistryPush {
            credential: credential.into(),
        }
    }

    /// Creates a remote deploy step
    pub fn remote_deploy(target_host: impl Into<String>, credential: impl Into<String>) -> Self {
        Self::RemoteDeploy {
            target_host: target_host.into(),
            credential: credential.into(),
        }
    }

    /// Short identifier used in logs and diagnostics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Analyze { .. } => "analyze",
            Self::Test => "test",
            Self::QualityGate { .. } => "quality_gate",
            Self::ImageBuild { .. } => "image_build",
            Self::VulnerabilityScan { .. } => "vulnerability_scan",
            Self::RegistryPush { .. } => "registry_push",
            Self::RemoteDeploy { .. } => "remote_deploy",
        }
    }

    /// Reference this step needs from an earlier step
    pub fn needs(&self) -> Option<StepOutput> {
        match self {
            Self::Test | Self::ImageBuild { .. } => Some(StepOutput::Artifact),
            Self::VulnerabilityScan { .. } | Self::RegistryPush { .. } | Self::RemoteDeploy { .. } => {
                Some(StepOutput::Image)
            }
            Self::Build | Self::Analyze { .. } | Self::QualityGate { .. } => None,
        }
    }

    /// Reference this step produces for later steps
    pub fn produces(&self) -> Option<StepOutput> {
        match self {
            Self::Build => Some(StepOutput::Artifact),
            Self::ImageBuild { .. } => Some(StepOutput::Image),
            _ => None,
        }
    }

    /// Gate this step produces a verdict for
    pub fn verdict_for(&self) -> Option<GateKind> {
        match self {
            Self::QualityGate { .. } => Some(GateKind::Quality),
            Self::VulnerabilityScan { .. } => Some(GateKind::Security),
            _ => None,
        }
    }

    /// Returns true if running the step twice is harmless
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::RemoteDeploy { .. })
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build | Self::Test => write!(f, "{}", self.label()),
            Self::Analyze { project_key } | Self::QualityGate { project_key } => {
                write!(f, "{}({project_key})", self.label())
            }
            Self::ImageBuild { tag } => write!(f, "image_build({tag})"),
            Self::VulnerabilityScan { severities } => {
                write!(f, "vulnerability_scan({})", severities.join(","))
            }
            Self::RegistryPush { credential } => write!(f, "registry_push(credential={credential})"),
            Self::RemoteDeploy {
                target_host,
                credential,
            } => write!(f, "remote_deploy({target_host}, credential={credential})"),
        }
    }
}

impl Validate for StepKind {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        let invalid = |reason: &str| ValidationError::InvalidStep {
            step: self.label().to_string(),
            reason: reason.to_string(),
        };

        match self {
            Self::Build | Self::Test => Ok(()),
            Self::Analyze { project_key } | Self::QualityGate { project_key } => {
                if project_key.trim().is_empty() {
                    return Err(invalid("project key cannot be empty"));
                }
                Ok(())
            }
            Self::ImageBuild { tag } => {
                if tag.trim().is_empty() {
                    return Err(invalid("tag cannot be empty"));
                }
                Ok(())
            }
            Self::VulnerabilityScan { severities } => {
                if severities.is_empty() {
                    return Err(invalid("at least one severity is required"));
                }
                Ok(())
            }
            Self::RegistryPush { credential } => {
                if credential.trim().is_empty() {
                    return Err(invalid("credential cannot be empty"));
                }
                Ok(())
            }
            Self::RemoteDeploy {
                target_host,
                credential,
            } => {
                if target_host.trim().is_empty() {
                    return Err(invalid("target host cannot be empty"));
                }
                if credential.trim().is_empty() {
                    return Err(invalid("credential cannot be empty"));
                }
                Ok(())
            }
        }
    }
}

/// A single step in a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Type of step
    #[serde(flatten)]
    pub kind: StepKind,

    /// Optional name for the step
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl Step {
    /// Creates a new step
    pub fn new(kind: StepKind) -> Self {
        Self { kind, name: None }
    }

    /// Sets the name of the step
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name shown in diagnostics: the explicit name or the step label
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.label())
    }
}

impl From<StepKind> for Step {
    fn from(kind: StepKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}
