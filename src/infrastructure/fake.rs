//! Scripted adapters for tests

use super::adapter::{
    AdapterError, BuildRequest, BuildResponse, DeployRequest, DeployResponse, ExternalToolAdapter,
    ImageBuildRequest, ImageBuildResponse, NotifyRequest, PushRequest, PushResponse,
    QualityGateRequest, ScanRequest, TestRequest, TestResponse, ToolAdapters,
};
use crate::pipeline::verdict::{GateVerdict, metrics};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Adapter answering from a script, then from a fallback
pub(crate) struct ScriptedAdapter<Req, Resp> {
    name: String,
    script: Mutex<VecDeque<Result<Resp, AdapterError>>>,
    fallback: Mutex<Result<Resp, AdapterError>>,
    delay: Mutex<Option<Duration>>,
    panic: Mutex<Option<String>>,
    calls: Mutex<Vec<Req>>,
}

impl<Req, Resp> ScriptedAdapter<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + 'static,
{
    pub(crate) fn new(name: &str, fallback: Result<Resp, AdapterError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            delay: Mutex::new(None),
            panic: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queues an answer used before the fallback
    pub(crate) fn push(&self, result: Result<Resp, AdapterError>) {
        self.script.lock().push_back(result);
    }

    pub(crate) fn set_fallback(&self, result: Result<Resp, AdapterError>) {
        *self.fallback.lock() = result;
    }

    /// Every call sleeps this long before answering
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Every call panics with this message
    pub(crate) fn set_panic(&self, message: &str) {
        *self.panic.lock() = Some(message.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<Req> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl<Req, Resp> ExternalToolAdapter for ScriptedAdapter<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &Req) -> Result<Resp, AdapterError> {
        self.calls.lock().push(request.clone());
        let panic = self.panic.lock().clone();
        if let Some(message) = panic {
            panic!("{message}");
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// A passing quality verdict
pub(crate) fn clean_quality() -> GateVerdict {
    GateVerdict::new()
        .with_finding(metrics::NEW_ISSUES, 0)
        .with_finding(metrics::COVERAGE, 85.0)
        .with_finding(metrics::CRITICAL_BUGS, 0)
        .with_detail("quality gate status OK")
}

/// A passing security verdict
pub(crate) fn clean_scan() -> GateVerdict {
    GateVerdict::new()
        .with_finding(metrics::CRITICAL_CVES, 0)
        .with_finding(metrics::HIGH_CVES, 0)
        .with_finding(metrics::SECRETS, 0)
        .with_finding(metrics::MALWARE, 0)
}

/// Handles on every scripted adapter of a [`ToolAdapters`] set
pub(crate) struct FakeTools {
    pub build: Arc<ScriptedAdapter<BuildRequest, BuildResponse>>,
    pub test: Arc<ScriptedAdapter<TestRequest, TestResponse>>,
    pub quality_gate: Arc<ScriptedAdapter<QualityGateRequest, GateVerdict>>,
    pub image_builder: Arc<ScriptedAdapter<ImageBuildRequest, ImageBuildResponse>>,
    pub scanner: Arc<ScriptedAdapter<ScanRequest, GateVerdict>>,
    pub registry: Arc<ScriptedAdapter<PushRequest, PushResponse>>,
    pub deploy: Arc<ScriptedAdapter<DeployRequest, DeployResponse>>,
    pub notifier: Arc<ScriptedAdapter<NotifyRequest, ()>>,
}

impl FakeTools {
    /// Every tool succeeds and every verdict is clean
    pub(crate) fn passing() -> Self {
        Self {
            build: ScriptedAdapter::new(
                "build",
                Ok(BuildResponse {
                    artifact_ref: "target/app.jar".to_string(),
                    build_log: "BUILD SUCCESS".to_string(),
                }),
            ),
            test: ScriptedAdapter::new(
                "test",
                Ok(TestResponse {
                    report_ref: "target/surefire-reports".to_string(),
                    pass_count: 42,
                    fail_count: 0,
                }),
            ),
            quality_gate: ScriptedAdapter::new("quality_gate", Ok(clean_quality())),
            image_builder: ScriptedAdapter::new(
                "image_builder",
                Ok(ImageBuildResponse {
                    image_ref: "acme/shop:1".to_string(),
                }),
            ),
            scanner: ScriptedAdapter::new("scanner", Ok(clean_scan())),
            registry: ScriptedAdapter::new(
                "registry",
                Ok(PushResponse {
                    pushed_ref: "docker.io/acme/shop:1@sha256:abc".to_string(),
                }),
            ),
            deploy: ScriptedAdapter::new(
                "deploy",
                Ok(DeployResponse {
                    health_check_passed: true,
                    detail: "HTTP 200".to_string(),
                }),
            ),
            notifier: ScriptedAdapter::new("notifier", Ok(())),
        }
    }

    pub(crate) fn adapters(&self) -> ToolAdapters {
        ToolAdapters {
            build: self.build.clone(),
            test: self.test.clone(),
            quality_gate: self.quality_gate.clone(),
            image_builder: self.image_builder.clone(),
            scanner: self.scanner.clone(),
            registry: self.registry.clone(),
            deploy: self.deploy.clone(),
            notifier: self.notifier.clone(),
        }
    }
}
