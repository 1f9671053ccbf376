//! Static-analysis quality gate client
//!
//! Talks to a SonarQube-compatible server. The analysis itself is submitted
//! by the build tool; this adapter waits for the server to compute the
//! quality gate status and then reads the measures the gate policy needs.

use super::adapter::{AdapterError, ExternalToolAdapter, QualityGateRequest};
use super::credentials::{CredentialRef, SharedResolver};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::verdict::{Finding, GateVerdict, metrics};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Server metrics read after the gate is computed, with the finding they feed
const MEASURES: [(&str, &str); 4] = [
    ("new_violations", metrics::NEW_ISSUES),
    ("coverage", metrics::COVERAGE),
    ("critical_violations", metrics::CRITICAL_BUGS),
    ("sqale_rating", metrics::RATING),
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusResponse {
    project_status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: String,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Condition {
    status: String,
    metric_key: String,
    #[serde(default)]
    actual_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    component: Component,
}

#[derive(Debug, Deserialize)]
struct Component {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    period: Option<PeriodValue>,
    #[serde(default)]
    periods: Vec<PeriodValue>,
}

#[derive(Debug, Deserialize)]
struct PeriodValue {
    value: String,
}

impl Measure {
    fn raw(&self) -> Option<&str> {
        self.value
            .as_deref()
            .or_else(|| self.period.as_ref().map(|p| p.value.as_str()))
            .or_else(|| self.periods.first().map(|p| p.value.as_str()))
    }
}

/// Letter for a 1.0 to 5.0 server rating
fn rating_letter(value: f64) -> Option<&'static str> {
    match value.round() {
        r if (r - 1.0).abs() < f64::EPSILON => Some("A"),
        r if (r - 2.0).abs() < f64::EPSILON => Some("B"),
        r if (r - 3.0).abs() < f64::EPSILON => Some("C"),
        r if (r - 4.0).abs() < f64::EPSILON => Some("D"),
        r if (r - 5.0).abs() < f64::EPSILON => Some("E"),
        _ => None,
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "OK" | "WARN" | "ERROR")
}

fn verdict_from(status: &ProjectStatus, measures: &[Measure]) -> GateVerdict {
    let mut verdict = GateVerdict::new().with_blocking(status.status == "ERROR");

    for measure in measures {
        let Some((_, finding)) = MEASURES.iter().find(|(key, _)| *key == measure.metric) else {
            continue;
        };
        let Some(value) = measure.raw().and_then(|raw| raw.parse::<f64>().ok()) else {
            continue;
        };
        verdict = if *finding == metrics::RATING {
            match rating_letter(value) {
                Some(letter) => verdict.with_finding(*finding, letter),
                None => verdict,
            }
        } else {
            verdict.with_finding(*finding, Finding::Number(value))
        };
    }

    let failed: Vec<String> = status
        .conditions
        .iter()
        .filter(|c| c.status == "ERROR")
        .map(|c| match &c.actual_value {
            Some(actual) => format!("{}={actual}", c.metric_key),
            None => c.metric_key.clone(),
        })
        .collect();
    let detail = if failed.is_empty() {
        format!("quality gate status {}", status.status)
    } else {
        format!(
            "quality gate status {} ({})",
            status.status,
            failed.join(", ")
        )
    };
    verdict.with_detail(detail)
}

/// Quality gate adapter polling a SonarQube-compatible server
pub struct SonarQualityGate {
    client: reqwest::Client,
    base: Url,
    token: Option<CredentialRef>,
    credentials: SharedResolver,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl SonarQualityGate {
    /// Creates a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the URL is invalid.
    pub fn new(
        base_url: &str,
        token: Option<CredentialRef>,
        credentials: SharedResolver,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| PipelineError::Config(format!("server url '{base_url}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            token,
            credentials,
            poll_interval,
            wait_timeout,
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, AdapterError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| AdapterError::tool(-1, format!("bad endpoint '{path}': {e}")))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, AdapterError> {
        let mut request = self.client.get(url);
        let credential_name = match &self.token {
            Some(token) => {
                let credential = self.credentials.resolve(token)?;
                request = request.basic_auth(credential.secret.expose(), Some(""));
                token.to_string()
            }
            None => "anonymous".to_string(),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &credential_name, &body));
        }
        Ok(response.json::<T>().await?)
    }

    async fn wait_for_status(&self, project_key: &str) -> Result<ProjectStatus, AdapterError> {
        let url = self.endpoint("api/qualitygates/project_status", &[("projectKey", project_key)])?;
        let deadline = tokio::time::Instant::now() + self.wait_timeout;

        loop {
            let response: ProjectStatusResponse = self.get_json(url.clone()).await?;
            if is_terminal(&response.project_status.status) {
                return Ok(response.project_status);
            }
            tracing::debug!(
                project = project_key,
                status = %response.project_status.status,
                "Quality gate not computed yet"
            );
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(AdapterError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ExternalToolAdapter for SonarQualityGate {
    type Request = QualityGateRequest;
    type Response = GateVerdict;

    fn name(&self) -> &str {
        "quality_gate"
    }

    async fn invoke(&self, request: &QualityGateRequest) -> Result<GateVerdict, AdapterError> {
        let status = self.wait_for_status(&request.project_key).await?;

        let keys = MEASURES.map(|(key, _)| key).join(",");
        let url = self.endpoint(
            "api/measures/component",
            &[("component", request.project_key.as_str()), ("metricKeys", keys.as_str())],
        )?;
        let measures: MeasuresResponse = self.get_json(url).await?;

        Ok(verdict_from(&status, &measures.component.measures))
    }
}
