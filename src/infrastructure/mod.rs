//! Infrastructure layer
//!
//! This module contains the external tool adapters and the ambient services
//! (configuration, credentials, logging, metrics) they rely on.

pub mod adapter;
pub mod command;
mod config;
pub mod credentials;
#[cfg(test)]
pub(crate) mod fake;
mod logging;
mod metrics;
pub mod notify;
pub mod quality;
pub mod tools;
mod traced;

pub use adapter::{
    AdapterError, BuildGoal, BuildRequest, BuildResponse, DeployRequest, DeployResponse,
    ExternalToolAdapter, ImageBuildRequest, ImageBuildResponse, NotifyRequest, PushRequest,
    PushResponse, QualityGateRequest, ScanRequest, SourceRef, TestRequest, TestResponse,
    ToolAdapters,
};
pub use config::{Config, DeployConfig, NotifyConfig, QualityConfig, ToolsConfig};
pub use credentials::{
    Credential, CredentialChain, CredentialRef, CredentialResolver, EnvCredentials, Redactor,
    Secret, SharedResolver, StaticCredentials,
};
pub use logging::{LOG_ENV, init_logging};
pub use metrics::{MetricsCollector, PipelineMetrics};
pub use notify::{LogNotifier, WebhookNotifier};
pub use quality::SonarQualityGate;
pub use traced::Traced;
