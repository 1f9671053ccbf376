//! Run notifications
//!
//! The notifier is called once per run, after the run reached its terminal
//! status. [`WebhookNotifier`] posts a JSON summary (Slack-compatible `text`
//! field plus the structured summary); [`LogNotifier`] only logs it.

use super::adapter::{AdapterError, ExternalToolAdapter, NotifyRequest};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::run::RunSummary;
use crate::pipeline::types::RunStatus;
use async_trait::async_trait;
use serde::Serialize;
use url::Url;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: String,
    summary: &'a RunSummary,
}

/// Posts run summaries to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the URL is invalid.
    pub fn new(url: &str) -> Result<Self, PipelineError> {
        let url = Url::parse(url)
            .map_err(|e| PipelineError::Config(format!("webhook url '{url}': {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }
}

#[async_trait]
impl ExternalToolAdapter for WebhookNotifier {
    type Request = NotifyRequest;
    type Response = ();

    fn name(&self) -> &str {
        "notifier"
    }

    async fn invoke(&self, request: &NotifyRequest) -> Result<(), AdapterError> {
        let payload = WebhookPayload {
            text: request.summary.to_string(),
            summary: &request.summary,
        };
        let response = self.client.post(self.url.clone()).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, "webhook", &body));
        }
        Ok(())
    }
}

/// Writes run summaries to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ExternalToolAdapter for LogNotifier {
    type Request = NotifyRequest;
    type Response = ();

    fn name(&self) -> &str {
        "notifier"
    }

    async fn invoke(&self, request: &NotifyRequest) -> Result<(), AdapterError> {
        let summary = &request.summary;
        if summary.status == RunStatus::Succeeded {
            tracing::info!(run = %summary.run_id, "{summary}");
        } else {
            tracing::warn!(run = %summary.run_id, "{summary}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::options::TriggerCause;
    use crate::pipeline::run::Run;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn request() -> NotifyRequest {
        let mut run = Run::new(3, "shop", TriggerCause::manual("ops"));
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Succeeded).unwrap();
        NotifyRequest {
            summary: run.summary(),
            run,
        }
    }

    /// Accepts one request, answers with `code` and hands back the raw request.
    async fn serve_once(code: u16) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if n == 0 || text.trim_end().ends_with('}') {
                    break;
                }
            }
            let response =
                format!("HTTP/1.1 {code} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = tx.send(String::from_utf8_lossy(&received).to_string());
        });

        (format!("http://{addr}/hook"), rx)
    }

    #[tokio::test]
    async fn test_webhook_posts_summary() {
        let (url, received) = serve_once(200).await;
        WebhookNotifier::new(&url)
            .unwrap()
            .invoke(&request())
            .await
            .unwrap();

        let raw = received.await.unwrap();
        assert!(raw.starts_with("POST /hook"));
        assert!(raw.contains("shop #3 SUCCEEDED"));
        assert!(raw.contains("\"pipeline\":\"shop\""));
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let (url, _received) = serve_once(404).await;
        let result = WebhookNotifier::new(&url).unwrap().invoke(&request()).await;
        assert!(matches!(result, Err(AdapterError::Tool { code: 404, .. })));
    }

    #[test]
    fn test_invalid_webhook_url() {
        assert!(matches!(
            WebhookNotifier::new("::nope"),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.invoke(&request()).await.is_ok());
    }
}
