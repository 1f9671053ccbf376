//! Command execution for command-backed tools
//!
//! Tool invocations are described as templates such as
//! `docker build -t {tag} --build-arg ARTIFACT={artifact} .`. A template is
//! split into words first (with shell quoting rules) and placeholders are
//! substituted inside each word afterwards, so substituted values never
//! change the argument boundaries.
//!
//! ## Placeholders
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{source}` | Source revision |
//! | `{commit}` / `{branch}` | Revision parts |
//! | `{project}` | Static-analysis project key |
//! | `{artifact}` | Artifact reference |
//! | `{tag}` / `{image}` | Image tag and reference |
//! | `{severities}` | Comma-separated severities |
//! | `{host}` / `{user}` | Deploy target and credential user |

use super::adapter::AdapterError;
use super::credentials::{Redactor, Secret};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Lines of output kept in diagnostics
const OUTPUT_TAIL_LINES: usize = 20;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"));

/// A command line with `{placeholder}` slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    /// Creates a template
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Template text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the template and fills in placeholders
    ///
    /// Unknown placeholders are left as written.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Tool`] when the template has unbalanced
    /// quotes or is empty.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Result<Vec<String>, AdapterError> {
        let words = shell_words::split(&self.0)
            .map_err(|e| AdapterError::tool(-1, format!("malformed command '{}': {e}", self.0)))?;
        if words.is_empty() {
            return Err(AdapterError::tool(-1, "empty command"));
        }

        Ok(words
            .iter()
            .map(|word| {
                PLACEHOLDER
                    .replace_all(word, |caps: &regex::Captures| {
                        vars.get(&caps[1])
                            .cloned()
                            .unwrap_or_else(|| caps[0].to_string())
                    })
                    .into_owned()
            })
            .collect())
    }
}

impl From<&str> for CommandTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A fully rendered command
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Secret written to the process's standard input
    pub stdin: Option<Secret>,
}

impl CommandSpec {
    /// Creates a spec from rendered words
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    /// Adds an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feeds a secret on standard input
    #[must_use]
    pub fn stdin(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

/// Result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, redacted
    pub stdout: String,
    /// Standard error, redacted
    pub stderr: String,
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Wall-clock duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Returns true if the command exited with 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of combined output
    #[must_use]
    pub fn tail(&self) -> String {
        let combined = format!("{}{}", self.stdout, self.stderr);
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[start..].join("\n")
    }

    /// Converts a non-zero exit into [`AdapterError::Tool`]
    ///
    /// # Errors
    ///
    /// Returns the tool error carrying the output tail.
    pub fn into_success(self) -> Result<Self, AdapterError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AdapterError::tool(self.exit_code, self.tail()))
        }
    }
}

/// Runs tool processes
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    cwd: Option<PathBuf>,
}

impl CommandRunner {
    /// Creates a runner using the current directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Runs a command to completion
    ///
    /// Output is captured and passed through `redactor`. The process is not
    /// killed when the returned future is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Unreachable`] when the program cannot be
    /// started and [`AdapterError::Tool`] on I/O failure while it runs.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        redactor: &Redactor,
    ) -> Result<CommandOutput, AdapterError> {
        let program = spec.program();
        if program.is_empty() {
            return Err(AdapterError::tool(-1, "empty command"));
        }

        let mut cmd = Command::new(program);
        cmd.args(&spec.argv[1..])
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        tracing::debug!(program, args = spec.argv.len() - 1, "Executing command");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            AdapterError::Unreachable(format!("cannot start '{program}': {e}"))
        })?;

        if let Some(secret) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(secret.expose().as_bytes())
                .await
                .map_err(|e| AdapterError::tool(-1, format!("cannot write to '{program}': {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdapterError::tool(-1, format!("'{program}' failed: {e}")))?;

        let result = CommandOutput {
            stdout: redactor.redact(&String::from_utf8_lossy(&output.stdout)),
            stderr: redactor.redact(&String::from_utf8_lossy(&output.stderr)),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        };

        tracing::debug!(
            program,
            exit_code = result.exit_code,
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Command finished"
        );

        Ok(result)
    }
}
