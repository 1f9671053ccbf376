//! Stage execution
//!
//! Runs the steps of one stage through the tool adapters, applying the
//! per-call deadline, the retry policy and the stage's gate.

use super::context::RunContext;
use crate::gate::{GateDecision, GateEvaluator};
use crate::infrastructure::adapter::{
    AdapterError, BuildGoal, BuildRequest, DeployRequest, ImageBuildRequest, PushRequest,
    QualityGateRequest, ScanRequest, TestRequest, ToolAdapters,
};
use crate::infrastructure::credentials::CredentialRef;
use crate::pipeline::options::DEFAULT_STAGE_TIMEOUT_SECS;
use crate::pipeline::pipeline_def::GatePolicies;
use crate::pipeline::run::{AttemptRecord, StageResult};
use crate::pipeline::stage::{GateKind, Stage};
use crate::pipeline::steps::{Step, StepKind};
use crate::pipeline::types::StageStatus;
use crate::pipeline::verdict::GateVerdict;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};

/// Applies a deadline to an adapter call
async fn timed<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(AdapterError::Timeout))
}

/// What a successful step produced
struct StepOutcome {
    output: String,
    verdict: Option<GateVerdict>,
}

impl StepOutcome {
    fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            verdict: None,
        }
    }

    fn verdict(verdict: GateVerdict) -> Self {
        Self {
            output: verdict.to_string(),
            verdict: Some(verdict),
        }
    }
}

/// Outcome of one attempt at a stage
enum Attempt {
    Passed {
        diagnostic: String,
        verdict: Option<GateVerdict>,
        gate: Option<GateDecision>,
    },
    Blocked {
        verdict: Option<GateVerdict>,
        decision: GateDecision,
    },
    Failed {
        step: usize,
        error: AdapterError,
    },
}

/// Executes stages against a set of tool adapters
#[derive(Debug, Clone)]
pub struct StageExecutor {
    tools: ToolAdapters,
    policies: GatePolicies,
    default_timeout: Duration,
}

impl StageExecutor {
    /// Creates an executor with the built-in default deadline
    pub fn new(tools: ToolAdapters, policies: GatePolicies) -> Self {
        Self {
            tools,
            policies,
            default_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        }
    }

    /// Sets the deadline for stages that do not configure one
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The adapters this executor calls
    pub fn tools(&self) -> &ToolAdapters {
        &self.tools
    }

    /// Executes a stage and returns its single result
    ///
    /// Transient adapter failures are retried with exponential backoff up to
    /// the stage's attempt limit. A blocked gate is final. When the verdict
    /// of a gated stage cannot be obtained the gate blocks.
    pub async fn execute(&self, stage: &Stage, ctx: &mut RunContext) -> StageResult {
        let deadline = stage
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);
        let max_attempts = stage.retry.max_attempts.max(1);
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut failed_attempts = Vec::new();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            let attempt_started = Utc::now();
            tracing::info!(
                stage = %stage.name,
                attempt,
                max_attempts,
                timeout_secs = deadline.as_secs(),
                "Executing stage"
            );

            match self.attempt(stage, ctx, deadline).await {
                Attempt::Passed {
                    diagnostic,
                    verdict,
                    gate,
                } => {
                    break finish(
                        stage,
                        StageStatus::Passed,
                        attempt,
                        started_at,
                        diagnostic,
                        (verdict, gate),
                        failed_attempts,
                    );
                }
                Attempt::Blocked { verdict, decision } => {
                    tracing::warn!(
                        stage = %stage.name,
                        gate = %stage.gate,
                        violations = decision.violations().len(),
                        "{decision}"
                    );
                    break finish(
                        stage,
                        StageStatus::Blocked,
                        attempt,
                        started_at,
                        decision.to_string(),
                        (verdict, Some(decision)),
                        failed_attempts,
                    );
                }
                Attempt::Failed { step, error } => {
                    let step_name = stage.steps[step].display_name().to_string();

                    if error.is_transient() && attempt < max_attempts {
                        let backoff = stage.retry.backoff_for(attempt);
                        tracing::warn!(
                            stage = %stage.name,
                            step = %step_name,
                            attempt,
                            error = %error,
                            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                            "Stage attempt failed, retrying"
                        );
                        failed_attempts.push(AttemptRecord {
                            attempt,
                            started_at: attempt_started,
                            finished_at: Utc::now(),
                            step: step_name,
                            reason: error.to_string(),
                        });
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    if is_verdict_step(stage, &stage.steps[step]) {
                        let decision = GateEvaluator::unavailable(&error.to_string());
                        tracing::warn!(
                            stage = %stage.name,
                            gate = %stage.gate,
                            error = %error,
                            "{decision}"
                        );
                        break finish(
                            stage,
                            StageStatus::Blocked,
                            attempt,
                            started_at,
                            decision.to_string(),
                            (None, Some(decision)),
                            failed_attempts,
                        );
                    }

                    tracing::error!(
                        stage = %stage.name,
                        step = %step_name,
                        attempt,
                        error = %error,
                        "Stage failed"
                    );
                    break finish(
                        stage,
                        StageStatus::Failed,
                        attempt,
                        started_at,
                        error.to_string(),
                        (None, None),
                        failed_attempts,
                    );
                }
            }
        };

        tracing::info!(
            stage = %stage.name,
            status = %result.status,
            attempts = result.attempts,
            duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Stage completed"
        );
        result
    }

    async fn attempt(&self, stage: &Stage, ctx: &mut RunContext, deadline: Duration) -> Attempt {
        let mut outputs = Vec::with_capacity(stage.steps.len());
        let mut verdict = None;

        for (index, step) in stage.steps.iter().enumerate() {
            tracing::debug!(stage = %stage.name, step = %step, "Executing step");
            match timed(deadline, self.run_step(&step.kind, ctx)).await {
                Ok(outcome) => {
                    if !outcome.output.is_empty() {
                        outputs.push(outcome.output);
                    }
                    if is_verdict_step(stage, step) {
                        verdict = outcome.verdict;
                    }
                }
                Err(error) => return Attempt::Failed { step: index, error },
            }
        }

        if stage.gate == GateKind::None {
            return Attempt::Passed {
                diagnostic: outputs.join("\n"),
                verdict: None,
                gate: None,
            };
        }

        let decision = match self.policy_for(stage.gate) {
            Some(policy) => GateEvaluator::evaluate(verdict.as_ref(), policy),
            None => GateEvaluator::unavailable(&format!("no {} policy", stage.gate)),
        };
        match (decision, verdict) {
            (GateDecision::Pass, verdict) => {
                outputs.push(GateDecision::Pass.to_string());
                Attempt::Passed {
                    diagnostic: outputs.join("\n"),
                    verdict,
                    gate: Some(GateDecision::Pass),
                }
            }
            (decision, verdict) => Attempt::Blocked { verdict, decision },
        }
    }

    fn policy_for(&self, gate: GateKind) -> Option<&crate::gate::GatePolicy> {
        match gate {
            GateKind::None => None,
            GateKind::Quality => self.policies.quality.as_ref(),
            GateKind::Security => self.policies.security.as_ref(),
        }
    }

    async fn run_step(
        &self,
        kind: &StepKind,
        ctx: &mut RunContext,
    ) -> Result<StepOutcome, AdapterError> {
        match kind {
            StepKind::Build => {
                let response = self
                    .tools
                    .build
                    .invoke(&BuildRequest {
                        source: ctx.source.clone(),
                        goal: BuildGoal::Package,
                    })
                    .await?;
                let output = format!("artifact {}", response.artifact_ref);
                ctx.artifact = Some(response.artifact_ref);
                Ok(StepOutcome::output(output))
            }
            StepKind::Analyze { project_key } => {
                let response = self
                    .tools
                    .build
                    .invoke(&BuildRequest {
                        source: ctx.source.clone(),
                        goal: BuildGoal::Analyze {
                            project_key: project_key.clone(),
                        },
                    })
                    .await?;
                Ok(StepOutcome::output(format!(
                    "analysis submitted for {project_key}: {}",
                    last_line(&response.build_log)
                )))
            }
            StepKind::Test => {
                let artifact_ref = require(ctx.artifact.as_deref(), "artifact")?;
                let response = self
                    .tools
                    .test
                    .invoke(&TestRequest { artifact_ref })
                    .await?;
                let total = response.pass_count + response.fail_count;
                if response.fail_count > 0 {
                    return Err(AdapterError::tool(
                        1,
                        format!("{} of {total} tests failed", response.fail_count),
                    ));
                }
                Ok(StepOutcome::output(format!(
                    "{} tests passed (report {})",
                    response.pass_count, response.report_ref
                )))
            }
            StepKind::QualityGate { project_key } => {
                let verdict = self
                    .tools
                    .quality_gate
                    .invoke(&QualityGateRequest {
                        source: ctx.source.clone(),
                        project_key: project_key.clone(),
                    })
                    .await?;
                Ok(StepOutcome::verdict(verdict))
            }
            StepKind::ImageBuild { tag } => {
                let artifact_ref = require(ctx.artifact.as_deref(), "artifact")?;
                let response = self
                    .tools
                    .image_builder
                    .invoke(&ImageBuildRequest {
                        artifact_ref,
                        tag: ctx.render_tag(tag),
                    })
                    .await?;
                let output = format!("image {}", response.image_ref);
                ctx.image = Some(response.image_ref);
                Ok(StepOutcome::output(output))
            }
            StepKind::VulnerabilityScan { severities } => {
                let image_ref = require(ctx.image.as_deref(), "image")?;
                let verdict = self
                    .tools
                    .scanner
                    .invoke(&ScanRequest {
                        image_ref,
                        severities: severities.clone(),
                    })
                    .await?;
                Ok(StepOutcome::verdict(verdict))
            }
            StepKind::RegistryPush { credential } => {
                let image_ref = require(ctx.image.as_deref(), "image")?;
                let response = self
                    .tools
                    .registry
                    .invoke(&PushRequest {
                        image_ref,
                        credential: CredentialRef::new(credential.as_str()),
                    })
                    .await?;
                let output = format!("pushed {}", response.pushed_ref);
                ctx.pushed = Some(response.pushed_ref);
                Ok(StepOutcome::output(output))
            }
            StepKind::RemoteDeploy {
                target_host,
                credential,
            } => {
                let image_ref = require(ctx.deployable_image(), "image")?;
                let response = self
                    .tools
                    .deploy
                    .invoke(&DeployRequest {
                        image_ref,
                        target_host: target_host.clone(),
                        credential: CredentialRef::new(credential.as_str()),
                    })
                    .await?;
                if !response.health_check_passed {
                    return Err(AdapterError::tool(
                        1,
                        format!("health check failed on {target_host}: {}", response.detail),
                    ));
                }
                Ok(StepOutcome::output(format!(
                    "deployed to {target_host}: {}",
                    response.detail
                )))
            }
        }
    }
}

fn finish(
    stage: &Stage,
    status: StageStatus,
    attempts: u32,
    started_at: DateTime<Utc>,
    diagnostic: String,
    (verdict, gate): (Option<GateVerdict>, Option<GateDecision>),
    failed_attempts: Vec<AttemptRecord>,
) -> StageResult {
    StageResult {
        stage: stage.name.clone(),
        status,
        attempts,
        started_at,
        finished_at: Utc::now(),
        diagnostic,
        verdict,
        gate,
        failed_attempts,
    }
}

fn is_verdict_step(stage: &Stage, step: &Step) -> bool {
    stage.gate.is_gated() && step.kind.verdict_for() == Some(stage.gate)
}

fn require(value: Option<&str>, what: &str) -> Result<String, AdapterError> {
    value
        .map(ToString::to_string)
        .ok_or_else(|| AdapterError::tool(-1, format!("no {what} produced by an earlier stage")))
}

fn last_line(log: &str) -> &str {
    log.lines().last().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapter::{DeployResponse, TestResponse};
    use crate::infrastructure::fake::FakeTools;
    use crate::pipeline::options::{RetryPolicy, TriggerCause};
    use crate::pipeline::run::Run;
    use crate::pipeline::verdict::metrics;
    use pretty_assertions::assert_eq;

    fn context() -> RunContext {
        let run = Run::new(5, "shop", TriggerCause::push("acme/shop", "main", "abc123"));
        let mut ctx = RunContext::for_run(&run, "acme/shop");
        ctx.artifact = Some("target/app.jar".to_string());
        ctx.image = Some("acme/shop:5".to_string());
        ctx
    }

    fn executor(fake: &FakeTools) -> StageExecutor {
        StageExecutor::new(fake.adapters(), GatePolicies::defaults())
    }

    fn no_backoff(attempts: u32) -> RetryPolicy {
        RetryPolicy::attempts(attempts).with_initial_backoff(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_build_stage_passes_and_records_artifact() {
        let fake = FakeTools::passing();
        let run = Run::new(1, "shop", TriggerCause::manual("ops"));
        let mut ctx = RunContext::for_run(&run, "acme/shop");

        let result = executor(&fake)
            .execute(&Stage::single("Build", StepKind::Build), &mut ctx)
            .await;

        assert_eq!(result.status, StageStatus::Passed);
        assert_eq!(result.attempts, 1);
        assert_eq!(ctx.artifact.as_deref(), Some("target/app.jar"));
        assert_eq!(fake.build.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_fails() {
        let fake = FakeTools::passing();
        fake.build.set_delay(Duration::from_secs(3600));
        let stage = Stage::single("Build", StepKind::Build).with_retry(RetryPolicy::attempts(2));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.diagnostic, "deadline exceeded");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failed_attempts.len(), 1);
        assert_eq!(result.failed_attempts[0].reason, "deadline exceeded");
        assert_eq!(fake.build.call_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let fake = FakeTools::passing();
        fake.build
            .push(Err(AdapterError::Unreachable("connection reset".into())));
        let stage = Stage::single("Build", StepKind::Build).with_retry(no_backoff(3));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Passed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failed_attempts[0].step, "build");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let fake = FakeTools::passing();
        fake.build.push(Err(AdapterError::tool(1, "compilation failed")));
        let stage = Stage::single("Build", StepKind::Build).with_retry(no_backoff(3));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.diagnostic, "tool error 1: compilation failed");
        assert_eq!(fake.build.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_tests_fail_the_stage() {
        let fake = FakeTools::passing();
        fake.test.set_fallback(Ok(TestResponse {
            report_ref: "report".to_string(),
            pass_count: 40,
            fail_count: 2,
        }));

        let result = executor(&fake)
            .execute(&Stage::single("Unit Tests", StepKind::Test), &mut context())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.diagnostic.contains("2 of 42 tests failed"));
    }

    #[tokio::test]
    async fn test_blocked_gate_reports_every_violation_and_never_retries() {
        let fake = FakeTools::passing();
        fake.scanner.set_fallback(Ok(GateVerdict::new()
            .with_finding(metrics::CRITICAL_CVES, 1)
            .with_finding(metrics::HIGH_CVES, 5)
            .with_finding(metrics::SECRETS, 0)
            .with_finding(metrics::MALWARE, 0)));
        let stage = Stage::single("Trivy Scan", StepKind::vulnerability_scan())
            .with_gate(GateKind::Security)
            .with_retry(no_backoff(3));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Blocked);
        assert_eq!(result.attempts, 1);
        assert_eq!(fake.scanner.call_count(), 1);
        let gate = result.gate.unwrap();
        assert_eq!(gate.violations().len(), 2);
        assert!(result.diagnostic.contains("criticalCVEs"));
        assert!(result.diagnostic.contains("highCVEs"));
        assert!(result.verdict.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_timeout_blocks() {
        let fake = FakeTools::passing();
        fake.quality_gate.set_delay(Duration::from_secs(3600));
        let stage = Stage::single("Quality Gate", StepKind::quality_gate("shop"))
            .with_gate(GateKind::Quality)
            .with_timeout(Duration::from_secs(5));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Blocked);
        assert!(result.diagnostic.contains("deadline exceeded"));
        assert!(result.gate.unwrap().is_block());
    }

    #[tokio::test]
    async fn test_missing_verdict_blocks_without_inventing_one() {
        let fake = FakeTools::passing();
        let stage = Stage::single("Trivy Scan", StepKind::Build).with_gate(GateKind::Security);

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Blocked);
        assert!(result.gate.unwrap().is_block());
        assert_eq!(result.verdict, None);
    }

    #[tokio::test]
    async fn test_passing_gate_keeps_raw_verdict() {
        let fake = FakeTools::passing();
        let stage = Stage::single("Quality Gate", StepKind::quality_gate("shop"))
            .with_gate(GateKind::Quality);

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Passed);
        assert_eq!(result.gate, Some(GateDecision::Pass));
        assert_eq!(
            result.verdict.unwrap().finding(metrics::COVERAGE),
            Some(&crate::pipeline::verdict::Finding::Number(85.0))
        );
    }

    #[tokio::test]
    async fn test_unhealthy_deploy_fails() {
        let fake = FakeTools::passing();
        fake.deploy.set_fallback(Ok(DeployResponse {
            health_check_passed: false,
            detail: "HTTP 503".to_string(),
        }));
        let stage = Stage::single("Deploy", StepKind::remote_deploy("10.0.0.5", "deploy-ssh"));

        let result = executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.diagnostic.contains("health check failed on 10.0.0.5: HTTP 503"));
        assert_eq!(fake.deploy.calls()[0].image_ref, "acme/shop:5");
    }

    #[tokio::test]
    async fn test_image_tag_is_rendered() {
        let fake = FakeTools::passing();
        let stage = Stage::single("Docker Build", StepKind::image_build("acme/shop:{commit}"));

        executor(&fake).execute(&stage, &mut context()).await;

        assert_eq!(fake.image_builder.calls()[0].tag, "acme/shop:abc123");
    }
}
