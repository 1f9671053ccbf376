//! Command-backed tool adapters
//!
//! Build, test, image, scan, push and deploy are driven through command
//! templates (see [`CommandTemplate`]). Secrets reach the processes on
//! stdin only and are redacted from everything captured.

use super::adapter::{
    AdapterError, BuildGoal, BuildRequest, BuildResponse, DeployRequest, DeployResponse,
    ExternalToolAdapter, ImageBuildRequest, ImageBuildResponse, PushRequest, PushResponse,
    QualityGateRequest, ScanRequest, TestRequest, TestResponse, ToolAdapters,
};
use super::command::{CommandOutput, CommandRunner, CommandSpec, CommandTemplate};
use super::config::{Config, DeployConfig, ToolsConfig};
use super::credentials::{CredentialRef, Redactor, SharedResolver};
use super::notify::{LogNotifier, WebhookNotifier};
use super::quality::SonarQualityGate;
use super::traced::Traced;
use crate::pipeline::errors::PipelineError;
use crate::pipeline::verdict::{GateVerdict, metrics};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

static SUREFIRE_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+),\s*Skipped:\s*(\d+)")
        .expect("surefire pattern is valid")
});

static LIBTEST_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) passed;\s*(\d+) failed").expect("libtest pattern is valid")
});

static PUSH_DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"digest:\s*(sha256:[0-9a-f]{64})").expect("digest pattern is valid")
});

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILED: i32 = 255;

fn vars<const N: usize>(pairs: [(&'static str, String); N]) -> BTreeMap<&'static str, String> {
    BTreeMap::from(pairs)
}

/// Build tool driven by the `build` and `analyze` templates
pub struct CommandBuildTool {
    runner: CommandRunner,
    package: CommandTemplate,
    analyze: CommandTemplate,
    artifact: String,
}

impl CommandBuildTool {
    /// Creates the tool from the tools config
    pub fn new(runner: CommandRunner, config: &ToolsConfig) -> Self {
        Self {
            runner,
            package: config.build.clone(),
            analyze: config.analyze.clone(),
            artifact: config.artifact.clone(),
        }
    }
}

#[async_trait]
impl ExternalToolAdapter for CommandBuildTool {
    type Request = BuildRequest;
    type Response = BuildResponse;

    fn name(&self) -> &str {
        "build"
    }

    async fn invoke(&self, request: &BuildRequest) -> Result<BuildResponse, AdapterError> {
        let mut values = vars([
            ("source", request.source.to_string()),
            ("commit", request.source.commit.clone()),
            ("branch", request.source.branch.clone()),
        ]);
        let template = match &request.goal {
            BuildGoal::Package => &self.package,
            BuildGoal::Analyze { project_key } => {
                values.insert("project", project_key.clone());
                &self.analyze
            }
        };

        let spec = CommandSpec::new(template.render(&values)?);
        let output = self
            .runner
            .run(&spec, &Redactor::default())
            .await?
            .into_success()?;

        Ok(BuildResponse {
            artifact_ref: match request.goal {
                BuildGoal::Package => self.artifact.clone(),
                BuildGoal::Analyze { .. } => String::new(),
            },
            build_log: output.tail(),
        })
    }
}

/// Test runner driven by the `test` template
///
/// Counts are read from the Maven Surefire or libtest summary line.
pub struct CommandTestTool {
    runner: CommandRunner,
    command: CommandTemplate,
    report: String,
}

impl CommandTestTool {
    /// Creates the tool from the tools config
    pub fn new(runner: CommandRunner, config: &ToolsConfig) -> Self {
        Self {
            runner,
            command: config.test.clone(),
            report: config.test_report.clone(),
        }
    }
}

/// Reads passed and failed test counts from test runner output
///
/// The last summary line wins, since Surefire prints per-class lines before
/// the totals.
pub fn parse_test_counts(output: &str) -> Option<(u32, u32)> {
    let surefire = SUREFIRE_SUMMARY.captures_iter(output).last().map(|caps| {
        let num = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
        let failed = num(2) + num(3);
        let passed = num(1).saturating_sub(failed + num(4));
        (passed, failed)
    });
    surefire.or_else(|| {
        LIBTEST_SUMMARY.captures_iter(output).last().map(|caps| {
            (
                caps[1].parse::<u32>().unwrap_or(0),
                caps[2].parse::<u32>().unwrap_or(0),
            )
        })
    })
}

#[async_trait]
impl ExternalToolAdapter for CommandTestTool {
    type Request = TestRequest;
    type Response = TestResponse;

    fn name(&self) -> &str {
        "test"
    }

    async fn invoke(&self, request: &TestRequest) -> Result<TestResponse, AdapterError> {
        let values = vars([("artifact", request.artifact_ref.clone())]);
        let spec = CommandSpec::new(self.command.render(&values)?);
        let output = self.runner.run(&spec, &Redactor::default()).await?;

        match parse_test_counts(&output.stdout) {
            Some((pass_count, fail_count)) if output.is_success() || fail_count > 0 => {
                Ok(TestResponse {
                    report_ref: self.report.clone(),
                    pass_count,
                    fail_count,
                })
            }
            _ => {
                let output = output.into_success()?;
                tracing::debug!(log = %output.tail(), "Test run without summary line");
                Ok(TestResponse {
                    report_ref: self.report.clone(),
                    pass_count: 0,
                    fail_count: 0,
                })
            }
        }
    }
}

/// Image builder driven by the `image_build` template
pub struct CommandImageBuilder {
    runner: CommandRunner,
    command: CommandTemplate,
}

impl CommandImageBuilder {
    /// Creates the tool from the tools config
    pub fn new(runner: CommandRunner, config: &ToolsConfig) -> Self {
        Self {
            runner,
            command: config.image_build.clone(),
        }
    }
}

#[async_trait]
impl ExternalToolAdapter for CommandImageBuilder {
    type Request = ImageBuildRequest;
    type Response = ImageBuildResponse;

    fn name(&self) -> &str {
        "image_build"
    }

    async fn invoke(&self, request: &ImageBuildRequest) -> Result<ImageBuildResponse, AdapterError> {
        let values = vars([
            ("artifact", request.artifact_ref.clone()),
            ("tag", request.tag.clone()),
        ]);
        let spec = CommandSpec::new(self.command.render(&values)?);
        self.runner
            .run(&spec, &Redactor::default())
            .await?
            .into_success()?;
        Ok(ImageBuildResponse {
            image_ref: request.tag.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Option<Vec<TrivyResult>>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
    #[serde(rename = "Secrets", default)]
    secrets: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "Severity")]
    severity: String,
}

/// Normalizes a Trivy JSON report into a security verdict
///
/// Advisories with a `MAL-` identifier (malicious packages) count as
/// malware rather than as CVEs.
///
/// # Errors
///
/// Returns [`AdapterError::Tool`] when the report is not valid JSON.
pub fn parse_trivy_report(json: &str) -> Result<GateVerdict, AdapterError> {
    let report: TrivyReport = serde_json::from_str(json)
        .map_err(|e| AdapterError::tool(-1, format!("unreadable scan report: {e}")))?;

    let (mut critical, mut high, mut secrets, mut malware) = (0u32, 0u32, 0u32, 0u32);
    for result in report.results.unwrap_or_default() {
        for vuln in result.vulnerabilities.unwrap_or_default() {
            if vuln.id.starts_with("MAL-") {
                malware += 1;
                continue;
            }
            match vuln.severity.as_str() {
                "CRITICAL" => critical += 1,
                "HIGH" => high += 1,
                _ => {}
            }
        }
        secrets += u32::try_from(result.secrets.map_or(0, |s| s.len())).unwrap_or(u32::MAX);
    }

    Ok(GateVerdict::new()
        .with_finding(metrics::CRITICAL_CVES, critical)
        .with_finding(metrics::HIGH_CVES, high)
        .with_finding(metrics::SECRETS, secrets)
        .with_finding(metrics::MALWARE, malware)
        .with_detail(format!(
            "{critical} critical, {high} high, {secrets} secrets, {malware} malware"
        )))
}

/// Vulnerability scanner driven by the `scan` template (Trivy JSON output)
pub struct TrivyScanner {
    runner: CommandRunner,
    command: CommandTemplate,
}

impl TrivyScanner {
    /// Creates the tool from the tools config
    pub fn new(runner: CommandRunner, config: &ToolsConfig) -> Self {
        Self {
            runner,
            command: config.scan.clone(),
        }
    }
}

#[async_trait]
impl ExternalToolAdapter for TrivyScanner {
    type Request = ScanRequest;
    type Response = GateVerdict;

    fn name(&self) -> &str {
        "vulnerability_scan"
    }

    async fn invoke(&self, request: &ScanRequest) -> Result<GateVerdict, AdapterError> {
        let values = vars([
            ("image", request.image_ref.clone()),
            ("severities", request.severities.join(",")),
        ]);
        let spec = CommandSpec::new(self.command.render(&values)?);
        let output = self
            .runner
            .run(&spec, &Redactor::default())
            .await?
            .into_success()?;
        parse_trivy_report(&output.stdout)
    }
}

/// Registry push: login with the password on stdin, then push
pub struct CommandRegistry {
    runner: CommandRunner,
    login: CommandTemplate,
    push: CommandTemplate,
    registry: String,
    credentials: SharedResolver,
}

impl CommandRegistry {
    /// Creates the tool from the tools config
    pub fn new(runner: CommandRunner, config: &ToolsConfig, credentials: SharedResolver) -> Self {
        Self {
            runner,
            login: config.registry_login.clone(),
            push: config.push.clone(),
            registry: config.registry.clone(),
            credentials,
        }
    }
}

fn refused(output: &CommandOutput) -> bool {
    let text = output.tail().to_ascii_lowercase();
    ["unauthorized", "denied", "authentication required"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[async_trait]
impl ExternalToolAdapter for CommandRegistry {
    type Request = PushRequest;
    type Response = PushResponse;

    fn name(&self) -> &str {
        "registry_push"
    }

    async fn invoke(&self, request: &PushRequest) -> Result<PushResponse, AdapterError> {
        let credential = self.credentials.resolve(&request.credential)?;
        let user = credential
            .username
            .clone()
            .ok_or_else(|| AdapterError::InvalidCredential(request.credential.to_string()))?;
        let redactor = Redactor::new([&credential.secret]);

        let login = CommandSpec::new(self.login.render(&vars([
            ("user", user),
            ("registry", self.registry.clone()),
        ]))?)
        .stdin(credential.secret.clone());
        let output = self.runner.run(&login, &redactor).await?;
        if !output.is_success() {
            if refused(&output) {
                return Err(AdapterError::InvalidCredential(request.credential.to_string()));
            }
            return Err(AdapterError::tool(output.exit_code, output.tail()));
        }

        let push = CommandSpec::new(
            self.push
                .render(&vars([("image", request.image_ref.clone())]))?,
        );
        let output = self.runner.run(&push, &redactor).await?.into_success()?;

        let pushed_ref = PUSH_DIGEST
            .captures(&output.stdout)
            .map_or_else(
                || request.image_ref.clone(),
                |caps| format!("{}@{}", request.image_ref, &caps[1]),
            );
        Ok(PushResponse { pushed_ref })
    }
}

/// HTTP health check run after a deployment
#[derive(Debug, Clone)]
pub struct HealthCheck {
    client: reqwest::Client,
    url: String,
    attempts: u32,
    interval: Duration,
}

impl HealthCheck {
    /// Creates a check against `url` (`{host}` is substituted per call)
    pub fn new(url: impl Into<String>, attempts: u32, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Polls the health URL until it answers with a success status
    pub async fn probe(&self, host: &str) -> (bool, String) {
        let url = self.url.replace("{host}", host);
        let mut last = String::from("no attempt made");

        for attempt in 1..=self.attempts {
            match self.client.get(&url).timeout(self.interval.max(Duration::from_secs(1))).send().await {
                Ok(response) if response.status().is_success() => {
                    return (true, format!("{url} answered {}", response.status()));
                }
                Ok(response) => last = format!("{url} answered {}", response.status()),
                Err(e) => last = format!("{url} unreachable: {e}"),
            }
            tracing::debug!(attempt, url = %url, "Health check not passing yet");
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        (false, last)
    }
}

/// Remote deploy over a secure shell, followed by a health check
pub struct SshDeployer {
    runner: CommandRunner,
    command: CommandTemplate,
    default_user: String,
    credentials: SharedResolver,
    health: Option<HealthCheck>,
}

impl SshDeployer {
    /// Creates the tool from the deploy config
    pub fn new(runner: CommandRunner, config: &DeployConfig, credentials: SharedResolver) -> Self {
        Self {
            runner,
            command: config.command.clone(),
            default_user: config.user.clone(),
            credentials,
            health: config.health_url.as_ref().map(|url| {
                HealthCheck::new(
                    url.clone(),
                    config.health_attempts,
                    Duration::from_secs(config.health_interval_secs),
                )
            }),
        }
    }
}

#[async_trait]
impl ExternalToolAdapter for SshDeployer {
    type Request = DeployRequest;
    type Response = DeployResponse;

    fn name(&self) -> &str {
        "remote_deploy"
    }

    async fn invoke(&self, request: &DeployRequest) -> Result<DeployResponse, AdapterError> {
        let credential = self.credentials.resolve(&request.credential)?;
        let redactor = Redactor::new([&credential.secret]);
        let user = credential
            .username
            .clone()
            .unwrap_or_else(|| self.default_user.clone());

        let spec = CommandSpec::new(self.command.render(&vars([
            ("user", user),
            ("host", request.target_host.clone()),
            ("image", request.image_ref.clone()),
        ]))?)
        .stdin(credential.secret.clone());

        let output = self.runner.run(&spec, &redactor).await?;
        if output.exit_code == SSH_CONNECTION_FAILED {
            return Err(AdapterError::Unreachable(format!(
                "{}: {}",
                request.target_host,
                output.tail()
            )));
        }
        output.into_success()?;

        match &self.health {
            Some(check) => {
                let (health_check_passed, detail) = check.probe(&request.target_host).await;
                Ok(DeployResponse {
                    health_check_passed,
                    detail,
                })
            }
            None => Ok(DeployResponse {
                health_check_passed: true,
                detail: "no health check configured".to_string(),
            }),
        }
    }
}

/// Stand-in for a collaborator that is not configured
///
/// Every call fails as unreachable, so gated stages relying on it block.
pub struct Unavailable<Req, Resp> {
    name: &'static str,
    reason: String,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Unavailable<Req, Resp> {
    /// Creates the stand-in
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp> ExternalToolAdapter for Unavailable<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _request: &Req) -> Result<Resp, AdapterError> {
        Err(AdapterError::Unreachable(self.reason.clone()))
    }
}

impl ToolAdapters {
    /// Builds the concrete adapters described by a config
    ///
    /// Every adapter is wrapped in [`Traced`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a server URL is invalid.
    pub fn from_config(config: &Config, credentials: SharedResolver) -> Result<Self, PipelineError> {
        let runner = match &config.workdir {
            Some(dir) => CommandRunner::new().with_cwd(dir),
            None => CommandRunner::new(),
        };
        let tools = &config.tools;

        let quality_gate: super::adapter::QualityGateTool = match &config.quality.server_url {
            Some(url) => Arc::new(Traced::new(SonarQualityGate::new(
                url,
                config.quality.token.as_deref().map(CredentialRef::new),
                Arc::clone(&credentials),
                Duration::from_secs(config.quality.poll_interval_secs),
                Duration::from_secs(config.quality.wait_timeout_secs),
            )?)),
            None => Arc::new(Traced::new(Unavailable::<QualityGateRequest, GateVerdict>::new(
                "quality_gate",
                "no static-analysis server configured",
            ))),
        };

        let notifier: super::adapter::NotifierTool = match &config.notify.webhook_url {
            Some(url) => Arc::new(Traced::new(WebhookNotifier::new(url)?)),
            None => Arc::new(Traced::new(LogNotifier)),
        };

        Ok(Self {
            build: Arc::new(Traced::new(CommandBuildTool::new(runner.clone(), tools))),
            test: Arc::new(Traced::new(CommandTestTool::new(runner.clone(), tools))),
            quality_gate,
            image_builder: Arc::new(Traced::new(CommandImageBuilder::new(runner.clone(), tools))),
            scanner: Arc::new(Traced::new(TrivyScanner::new(runner.clone(), tools))),
            registry: Arc::new(Traced::new(CommandRegistry::new(
                runner.clone(),
                tools,
                Arc::clone(&credentials),
            ))),
            deploy: Arc::new(Traced::new(SshDeployer::new(runner, &config.deploy, credentials))),
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::credentials::{Credential, StaticCredentials};
    use crate::pipeline::verdict::Finding;

    #[test]
    fn test_parse_surefire_counts() {
        let output = "\
[INFO] Tests run: 3, Failures: 0, Errors: 0, Skipped: 0, in OrderTest
[INFO] Tests run: 120, Failures: 2, Errors: 1, Skipped: 4
[INFO] BUILD FAILURE";
        assert_eq!(parse_test_counts(output), Some((113, 3)));
    }

    #[test]
    fn test_parse_libtest_counts() {
        let output = "test result: ok. 42 passed; 0 failed; 1 ignored";
        assert_eq!(parse_test_counts(output), Some((42, 0)));
        assert_eq!(parse_test_counts("nothing here"), None);
    }

    #[test]
    fn test_parse_trivy_report() {
        let json = r#"{
            "SchemaVersion": 2,
            "Results": [
                {
                    "Target": "acme/shop:42 (alpine 3.19)",
                    "Vulnerabilities": [
                        {"VulnerabilityID": "CVE-2024-0001", "Severity": "CRITICAL"},
                        {"VulnerabilityID": "CVE-2024-0002", "Severity": "HIGH"},
                        {"VulnerabilityID": "CVE-2024-0003", "Severity": "HIGH"},
                        {"VulnerabilityID": "MAL-2024-0004", "Severity": "CRITICAL"}
                    ]
                },
                {
                    "Target": "app/config.yaml",
                    "Vulnerabilities": null,
                    "Secrets": [{"RuleID": "aws-access-key-id"}]
                }
            ]
        }"#;
        let verdict = parse_trivy_report(json).unwrap();
        assert_eq!(verdict.finding(metrics::CRITICAL_CVES), Some(&Finding::Number(1.0)));
        assert_eq!(verdict.finding(metrics::HIGH_CVES), Some(&Finding::Number(2.0)));
        assert_eq!(verdict.finding(metrics::SECRETS), Some(&Finding::Number(1.0)));
        assert_eq!(verdict.finding(metrics::MALWARE), Some(&Finding::Number(1.0)));
        assert!(!verdict.blocking);
    }

    #[test]
    fn test_clean_trivy_report() {
        let verdict = parse_trivy_report(r#"{"SchemaVersion": 2}"#).unwrap();
        assert_eq!(verdict.finding(metrics::CRITICAL_CVES), Some(&Finding::Number(0.0)));
        assert!(parse_trivy_report("not json").is_err());
    }

    #[tokio::test]
    async fn test_registry_requires_known_credential() {
        let registry = CommandRegistry::new(
            CommandRunner::new(),
            &ToolsConfig::default(),
            Arc::new(StaticCredentials::new()),
        );
        let result = registry
            .invoke(&PushRequest {
                image_ref: "acme/shop:42".to_string(),
                credential: CredentialRef::new("registry"),
            })
            .await;
        assert_eq!(
            result,
            Err(AdapterError::InvalidCredential("registry".to_string()))
        );
    }

    #[tokio::test]
    async fn test_registry_requires_user_name() {
        let store = StaticCredentials::new();
        store.insert("registry", Credential::secret("token"));
        let registry =
            CommandRegistry::new(CommandRunner::new(), &ToolsConfig::default(), Arc::new(store));
        let result = registry
            .invoke(&PushRequest {
                image_ref: "acme/shop:42".to_string(),
                credential: CredentialRef::new("registry"),
            })
            .await;
        assert!(matches!(result, Err(AdapterError::InvalidCredential(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_tool_runs_template() {
        let config = ToolsConfig {
            build: "sh -c 'echo building {commit}'".into(),
            artifact: "dist/app.tar".to_string(),
            ..ToolsConfig::default()
        };
        let tool = CommandBuildTool::new(CommandRunner::new(), &config);
        let response = tool
            .invoke(&BuildRequest {
                source: super::super::adapter::SourceRef {
                    repo: "acme/shop".to_string(),
                    branch: "main".to_string(),
                    commit: "abc123".to_string(),
                },
                goal: BuildGoal::Package,
            })
            .await
            .unwrap();
        assert_eq!(response.artifact_ref, "dist/app.tar");
        assert_eq!(response.build_log, "building abc123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deploy_without_health_check_redacts_secret() {
        let store = StaticCredentials::new();
        store.insert("deploy-ssh", Credential::user("ubuntu", "PRIVATE-KEY"));
        let config = DeployConfig {
            command: "sh -c 'cat; echo; echo {user}@{host} {image}; exit 1'".into(),
            health_url: None,
            ..DeployConfig::default()
        };
        let deployer = SshDeployer::new(CommandRunner::new(), &config, Arc::new(store));
        let result = deployer
            .invoke(&DeployRequest {
                image_ref: "acme/shop:42".to_string(),
                target_host: "10.0.0.12".to_string(),
                credential: CredentialRef::new("deploy-ssh"),
            })
            .await;

        let Err(AdapterError::Tool { code, message }) = result else {
            panic!("expected tool error");
        };
        assert_eq!(code, 1);
        assert!(message.contains("ubuntu@10.0.0.12 acme/shop:42"));
        assert!(!message.contains("PRIVATE-KEY"));
        assert!(message.contains("****"));
    }
}
