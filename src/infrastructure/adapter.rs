//! External tool adapters
//!
//! Every collaborator (build tool, test runner, static-analysis server,
//! image builder, scanner, registry, remote host, notification sink) sits
//! behind [`ExternalToolAdapter`]. Adapters normalize every failure into
//! [`AdapterError`]; transport errors never reach the executor raw.

use super::credentials::CredentialRef;
use crate::pipeline::options::TriggerCause;
use crate::pipeline::run::{Run, RunSummary};
use crate::pipeline::verdict::GateVerdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Normalized adapter failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The call did not finish before its deadline
    #[error("deadline exceeded")]
    Timeout,

    /// The tool or server could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The credential is missing or was refused
    #[error("invalid credential '{0}'")]
    InvalidCredential(String),

    /// The tool ran and reported an error
    #[error("tool error {code}: {message}")]
    Tool {
        /// Exit code or status code
        code: i32,
        /// Error message, with secrets redacted
        message: String,
    },
}

impl AdapterError {
    /// Creates a tool error
    pub fn tool(code: i32, message: impl Into<String>) -> Self {
        Self::Tool {
            code,
            message: message.into(),
        }
    }

    /// Returns true if retrying the call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unreachable(_))
    }

    /// Maps an unsuccessful HTTP status
    ///
    /// 401 and 403 name the credential that was refused; 5xx responses are
    /// treated as an unreachable server.
    pub fn from_status(status: reqwest::StatusCode, credential: &str, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::InvalidCredential(credential.to_string()),
            code @ 500..=599 => Self::Unreachable(format!("server returned {code}")),
            code => Self::tool(i32::from(code), body.trim().to_string()),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::tool(-1, format!("malformed response: {err}"))
        } else {
            Self::tool(-1, err.to_string())
        }
    }
}

/// Uniform interface over one external collaborator
#[async_trait]
pub trait ExternalToolAdapter: Send + Sync {
    /// Request accepted by the tool
    type Request: Send + Sync;
    /// Normalized success payload
    type Response: Send;

    /// Name used in logs
    fn name(&self) -> &str;

    /// Calls the tool
    async fn invoke(&self, request: &Self::Request) -> Result<Self::Response, AdapterError>;
}

#[async_trait]
impl<A: ExternalToolAdapter + ?Sized> ExternalToolAdapter for Arc<A> {
    type Request = A::Request;
    type Response = A::Response;

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn invoke(&self, request: &Self::Request) -> Result<Self::Response, AdapterError> {
        (**self).invoke(request).await
    }
}

/// Source revision a run builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Repository identifier
    pub repo: String,
    /// Branch
    pub branch: String,
    /// Commit, empty when unknown (poll and manual triggers)
    pub commit: String,
}

impl SourceRef {
    /// Source revision implied by a trigger cause
    pub fn from_cause(cause: &TriggerCause, default_repo: &str) -> Self {
        match cause {
            TriggerCause::Push {
                repo,
                branch,
                commit,
            } => Self {
                repo: repo.clone(),
                branch: branch.clone(),
                commit: commit.clone(),
            },
            TriggerCause::Poll { .. } | TriggerCause::Manual { .. } => Self {
                repo: default_repo.to_string(),
                branch: "main".to_string(),
                commit: String::new(),
            },
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.commit.is_empty() {
            write!(f, "{}@{}", self.repo, self.branch)
        } else {
            write!(f, "{}@{}", self.repo, self.commit)
        }
    }
}

/// What the build tool should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildGoal {
    /// Compile and package
    Package,
    /// Submit static analysis for a project
    Analyze {
        /// Project key on the analysis server
        project_key: String,
    },
}

/// Build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Revision to build
    pub source: SourceRef,
    /// Goal to run
    pub goal: BuildGoal,
}

/// Build response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResponse {
    /// Reference to the packaged artifact
    pub artifact_ref: String,
    /// Tail of the build log
    pub build_log: String,
}

/// Test request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    /// Artifact under test
    pub artifact_ref: String,
}

/// Test response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResponse {
    /// Where the archived report lives
    pub report_ref: String,
    /// Passed tests
    pub pass_count: u32,
    /// Failed tests
    pub fail_count: u32,
}

/// Quality gate request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityGateRequest {
    /// Revision that was analysed
    pub source: SourceRef,
    /// Project key on the analysis server
    pub project_key: String,
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    /// Artifact copied into the image
    pub artifact_ref: String,
    /// Image tag
    pub tag: String,
}

/// Image build response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildResponse {
    /// Reference to the built image
    pub image_ref: String,
}

/// Vulnerability scan request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Image to scan
    pub image_ref: String,
    /// Severities to report
    pub severities: Vec<String>,
}

/// Registry push request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Image to push
    pub image_ref: String,
    /// Registry credential
    pub credential: CredentialRef,
}

/// Registry push response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    /// Pushed reference, with digest when the registry reports one
    pub pushed_ref: String,
}

/// Remote deploy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Image to run
    pub image_ref: String,
    /// Host to deploy on
    pub target_host: String,
    /// Remote-shell credential
    pub credential: CredentialRef,
}

/// Remote deploy response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResponse {
    /// Whether the deployed service answered its health check
    pub health_check_passed: bool,
    /// Health check detail
    pub detail: String,
}

/// Notification request
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyRequest {
    /// Condensed outcome
    pub summary: RunSummary,
    /// Final run snapshot
    pub run: Run,
}

/// Build tool adapter
pub type BuildTool = Arc<dyn ExternalToolAdapter<Request = BuildRequest, Response = BuildResponse>>;
/// Test runner adapter
pub type TestTool = Arc<dyn ExternalToolAdapter<Request = TestRequest, Response = TestResponse>>;
/// Quality gate adapter
pub type QualityGateTool =
    Arc<dyn ExternalToolAdapter<Request = QualityGateRequest, Response = GateVerdict>>;
/// Image builder adapter
pub type ImageBuilderTool =
    Arc<dyn ExternalToolAdapter<Request = ImageBuildRequest, Response = ImageBuildResponse>>;
/// Vulnerability scanner adapter
pub type ScannerTool = Arc<dyn ExternalToolAdapter<Request = ScanRequest, Response = GateVerdict>>;
/// Registry push adapter
pub type RegistryTool = Arc<dyn ExternalToolAdapter<Request = PushRequest, Response = PushResponse>>;
/// Remote deploy adapter
pub type DeployTool =
    Arc<dyn ExternalToolAdapter<Request = DeployRequest, Response = DeployResponse>>;
/// Notifier adapter
pub type NotifierTool = Arc<dyn ExternalToolAdapter<Request = NotifyRequest, Response = ()>>;

/// The full set of collaborators a pipeline talks to
#[derive(Clone)]
pub struct ToolAdapters {
    /// Build tool (package and analysis submission)
    pub build: BuildTool,
    /// Test runner
    pub test: TestTool,
    /// Static-analysis quality gate
    pub quality_gate: QualityGateTool,
    /// Image builder
    pub image_builder: ImageBuilderTool,
    /// Vulnerability scanner
    pub scanner: ScannerTool,
    /// Registry push
    pub registry: RegistryTool,
    /// Remote deploy
    pub deploy: DeployTool,
    /// Notification sink
    pub notifier: NotifierTool,
}

impl fmt::Debug for ToolAdapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolAdapters")
            .field("build", &self.build.name())
            .field("test", &self.test.name())
            .field("quality_gate", &self.quality_gate.name())
            .field("image_builder", &self.image_builder.name())
            .field("scanner", &self.scanner.name())
            .field("registry", &self.registry.name())
            .field("deploy", &self.deploy.name())
            .field("notifier", &self.notifier.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(AdapterError::Timeout.is_transient());
        assert!(AdapterError::Unreachable("connection refused".into()).is_transient());
        assert!(!AdapterError::InvalidCredential("registry".into()).is_transient());
        assert!(!AdapterError::tool(1, "compilation failed").is_transient());
    }

    #[test]
    fn test_timeout_renders_deadline_exceeded() {
        assert_eq!(AdapterError::Timeout.to_string(), "deadline exceeded");
        assert_eq!(
            AdapterError::tool(2, "no such image").to_string(),
            "tool error 2: no such image"
        );
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert_eq!(
            AdapterError::from_status(StatusCode::UNAUTHORIZED, "sonar-token", ""),
            AdapterError::InvalidCredential("sonar-token".to_string())
        );
        assert!(AdapterError::from_status(StatusCode::BAD_GATEWAY, "x", "").is_transient());
        assert_eq!(
            AdapterError::from_status(StatusCode::NOT_FOUND, "x", " no project \n"),
            AdapterError::tool(404, "no project")
        );
    }

    #[test]
    fn test_source_ref_from_cause() {
        let source = SourceRef::from_cause(&TriggerCause::push("acme/shop", "main", "abc123"), "x");
        assert_eq!(source.to_string(), "acme/shop@abc123");

        let source = SourceRef::from_cause(&TriggerCause::poll("@hourly"), "acme/shop");
        assert_eq!(source.to_string(), "acme/shop@main");
    }
}
