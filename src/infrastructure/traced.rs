//! Tracing decorator for adapters

use super::adapter::{AdapterError, ExternalToolAdapter};
use async_trait::async_trait;
use std::time::Instant;
use tracing::Instrument;

/// Wraps an adapter so every call runs in an `adapter.invoke` span and logs
/// its outcome with the elapsed time
#[derive(Debug, Clone)]
pub struct Traced<A> {
    inner: A,
}

impl<A> Traced<A> {
    /// Wraps `inner`
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    /// The wrapped adapter
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: ExternalToolAdapter> ExternalToolAdapter for Traced<A> {
    type Request = A::Request;
    type Response = A::Response;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, request: &Self::Request) -> Result<Self::Response, AdapterError> {
        let name = self.inner.name();
        let span = tracing::info_span!("adapter.invoke", adapter = name);

        async move {
            let start = Instant::now();
            let result = self.inner.invoke(request).await;
            let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &result {
                Ok(_) => tracing::debug!(elapsed_ms, "Adapter call succeeded"),
                Err(e) if e.is_transient() => {
                    tracing::warn!(elapsed_ms, error = %e, "Adapter call failed (transient)");
                }
                Err(e) => tracing::error!(elapsed_ms, error = %e, "Adapter call failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ExternalToolAdapter for Echo {
        type Request = String;
        type Response = String;

        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, request: &String) -> Result<String, AdapterError> {
            if request.is_empty() {
                Err(AdapterError::Timeout)
            } else {
                Ok(request.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_traced_passes_results_through() {
        let traced = Traced::new(Echo);
        assert_eq!(traced.name(), "echo");
        assert_eq!(traced.invoke(&"hi".to_string()).await.unwrap(), "hi");
        assert_eq!(
            traced.invoke(&String::new()).await,
            Err(AdapterError::Timeout)
        );
    }
}
