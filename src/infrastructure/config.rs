//! Configuration management
//!
//! The application config is a YAML file. Every section has defaults, so an
//! empty file (or no file) is a valid configuration. A few settings can be
//! overridden from the environment:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `STAGEGATE_LOG_LEVEL` | `log_level` |
//! | `STAGEGATE_SONAR_URL` | `quality.server_url` |
//! | `STAGEGATE_WEBHOOK_URL` | `notify.webhook_url` |

use super::command::CommandTemplate;
use super::credentials::{
    Credential, CredentialChain, EnvCredentials, SharedResolver, StaticCredentials,
};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::options::{ConcurrencyPolicy, DEFAULT_STAGE_TIMEOUT_SECS};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    pub log_level: String,
    /// Per-call deadline for stages that do not set one, in seconds
    pub default_timeout_secs: u64,
    /// Deadline for the notifier call, in seconds
    pub notify_timeout_secs: u64,
    /// Working directory for tool commands
    pub workdir: Option<PathBuf>,
    /// Repository built by poll and manual triggers
    pub repo: String,
    /// Overrides the concurrency policy of every pipeline when set
    pub concurrency: Option<ConcurrencyPolicy>,
    /// Command-backed tools
    pub tools: ToolsConfig,
    /// Static-analysis server
    pub quality: QualityConfig,
    /// Remote deployment
    pub deploy: DeployConfig,
    /// Notifications
    pub notify: NotifyConfig,
    /// Inline credentials, by name
    pub credentials: BTreeMap<String, Credential>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            notify_timeout_secs: 30,
            workdir: None,
            repo: "local".to_string(),
            concurrency: None,
            tools: ToolsConfig::default(),
            quality: QualityConfig::default(),
            deploy: DeployConfig::default(),
            notify: NotifyConfig::default(),
            credentials: BTreeMap::new(),
        }
    }
}

/// Command templates of the command-backed tools
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Compile and package
    pub build: CommandTemplate,
    /// Artifact produced by `build`
    pub artifact: String,
    /// Submit static analysis
    pub analyze: CommandTemplate,
    /// Run the test suite
    pub test: CommandTemplate,
    /// Where the test report is archived
    pub test_report: String,
    /// Build the image
    pub image_build: CommandTemplate,
    /// Scan the image; must print a Trivy JSON report
    pub scan: CommandTemplate,
    /// Registry host
    pub registry: String,
    /// Log in to the registry; the password arrives on stdin
    pub registry_login: CommandTemplate,
    /// Push the image
    pub push: CommandTemplate,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            build: "mvn -B clean package -DskipTests".into(),
            artifact: "target/app.jar".to_string(),
            analyze: "mvn -B sonar:sonar -Dsonar.projectKey={project}".into(),
            test: "mvn -B test".into(),
            test_report: "target/surefire-reports".to_string(),
            image_build: "docker build -t {tag} --build-arg ARTIFACT={artifact} .".into(),
            scan: "trivy image --quiet --format json --exit-code 0 --scanners vuln,secret --severity {severities} {image}".into(),
            registry: "docker.io".to_string(),
            registry_login: "docker login -u {user} --password-stdin {registry}".into(),
            push: "docker push {image}".into(),
        }
    }
}

/// Static-analysis server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Server base URL; without it the quality gate is unavailable
    pub server_url: Option<String>,
    /// Name of the token credential
    pub token: Option<String>,
    /// Delay between status polls, in seconds
    pub poll_interval_secs: u64,
    /// How long to wait for a terminal status, in seconds
    pub wait_timeout_secs: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            poll_interval_secs: 5,
            wait_timeout_secs: 300,
        }
    }
}

/// Remote deployment settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Deploy command; the credential secret arrives on stdin
    pub command: CommandTemplate,
    /// Remote user when the credential has none
    pub user: String,
    /// Health check URL (`{host}` is substituted)
    pub health_url: Option<String>,
    /// Health check attempts
    pub health_attempts: u32,
    /// Delay between health check attempts, in seconds
    pub health_interval_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            command: CommandTemplate::new(
                "ssh-agent sh -c \"ssh-add - >/dev/null && ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new {user}@{host} 'docker pull {image} && (docker rm -f app || true) && docker run -d --name app -p 8080:8080 {image}'\"",
            ),
            user: "ec2-user".to_string(),
            health_url: Some("http://{host}:8080/actuator/health".to_string()),
            health_attempts: 10,
            health_interval_secs: 6,
        }
    }
}

/// Notification settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving a JSON summary of every run; logs only when unset
    pub webhook_url: Option<String>,
}

impl Config {
    /// Parses a config from YAML
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for malformed YAML or invalid values.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.check()?;
        Ok(config)
    }

    /// Loads a config file
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] when the file cannot be read, otherwise
    /// the errors of [`Config::from_yaml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Applies `STAGEGATE_*` overrides from the process environment
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `STAGEGATE_*` overrides through a custom lookup
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("STAGEGATE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = lookup("STAGEGATE_SONAR_URL") {
            self.quality.server_url = Some(url);
        }
        if let Some(url) = lookup("STAGEGATE_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        self
    }

    /// Checks values that cannot be expressed in the types
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the first invalid setting.
    pub fn check(&self) -> Result<(), PipelineError> {
        let positive = [
            ("default_timeout_secs", self.default_timeout_secs),
            ("notify_timeout_secs", self.notify_timeout_secs),
            ("quality.poll_interval_secs", self.quality.poll_interval_secs),
            ("quality.wait_timeout_secs", self.quality.wait_timeout_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(PipelineError::Config(format!("{name} must be positive")));
        }

        for (name, url) in [
            ("quality.server_url", &self.quality.server_url),
            ("notify.webhook_url", &self.notify.webhook_url),
        ] {
            if let Some(url) = url {
                Url::parse(url)
                    .map_err(|e| PipelineError::Config(format!("{name} '{url}': {e}")))?;
            }
        }
        Ok(())
    }

    /// Default per-call deadline
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Notifier deadline
    #[must_use]
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    /// Credential resolver: environment first, then the inline credentials
    #[must_use]
    pub fn credential_resolver(&self) -> SharedResolver {
        let inline: StaticCredentials = self
            .credentials
            .iter()
            .map(|(name, credential)| (name.clone(), credential.clone()))
            .collect();
        Arc::new(
            CredentialChain::new()
                .with(Arc::new(EnvCredentials::new()))
                .with(Arc::new(inline)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::credentials::CredentialRef;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.default_timeout(), Duration::from_secs(600));
        assert!(config.quality.server_url.is_none());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = Config::from_yaml_str("").unwrap();
        assert_eq!(config.notify_timeout_secs, 30);
        assert!(config.concurrency.is_none());
    }

    #[test]
    fn test_concurrency_override() {
        let config = Config::from_yaml_str("concurrency: queue\n").unwrap();
        assert_eq!(config.concurrency, Some(ConcurrencyPolicy::Queue));
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r"
log_level: debug
quality:
  server_url: https://sonar.example.com
  token: sonar-token
tools:
  registry: registry.example.com
credentials:
  registry:
    username: ci
    secret: s3cret
";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.quality.wait_timeout_secs, 300);
        assert_eq!(config.tools.registry, "registry.example.com");
        assert_eq!(config.tools.push.as_str(), "docker push {image}");

        let credential = config
            .credential_resolver()
            .resolve(&CredentialRef::new("registry"))
            .unwrap();
        assert_eq!(credential.username.as_deref(), Some("ci"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_yaml_str("default_timeout_secs: 0"),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            Config::from_yaml_str("notify:\n  webhook_url: not a url\n"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("STAGEGATE_LOG_LEVEL", "trace"),
            ("STAGEGATE_SONAR_URL", "http://sonar:9000"),
        ]);
        let config = Config::default().with_overrides(|k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.quality.server_url.as_deref(), Some("http://sonar:9000"));
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagegate.yaml");
        std::fs::write(&path, "repo: acme/shop\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().repo, "acme/shop");
        assert!(matches!(
            Config::load(dir.path().join("missing.yaml")),
            Err(PipelineError::Io(_))
        ));
    }
}
