//! Pipeline options and triggers
//!
//! This module defines trigger causes, retry policies and the concurrency
//! policy applied when a pipeline is triggered while a run is active.

use super::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-call deadline for stage steps, in seconds
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

/// What caused a run to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerCause {
    /// Push webhook event
    Push {
        /// Repository identifier
        repo: String,
        /// Branch that was pushed
        branch: String,
        /// Commit at the head of the push
        commit: String,
    },

    /// Poll timer event
    Poll {
        /// Schedule expression that fired
        schedule: String,
    },

    /// Started by an operator
    Manual {
        /// Who started the run
        #[serde(default)]
        user: String,
    },
}

impl TriggerCause {
    /// Creates a push cause
    pub fn push(
        repo: impl Into<String>,
        branch: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self::Push {
            repo: repo.into(),
            branch: branch.into(),
            commit: commit.into(),
        }
    }

    /// Creates a poll cause
    pub fn poll(schedule: impl Into<String>) -> Self {
        Self::Poll {
            schedule: schedule.into(),
        }
    }

    /// Creates a manual cause
    pub fn manual(user: impl Into<String>) -> Self {
        Self::Manual { user: user.into() }
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push {
                repo,
                branch,
                commit,
            } => write!(f, "push to {repo}@{branch} ({commit})"),
            Self::Poll { schedule } => write!(f, "poll ({schedule})"),
            Self::Manual { user } if user.is_empty() => write!(f, "manual"),
            Self::Manual { user } => write!(f, "manual by {user}"),
        }
    }
}

/// What to do when a run is triggered while another is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Refuse the new run
    #[default]
    Reject,
    /// Queue the new run behind the active one (FIFO)
    Queue,
}

/// Interval-based poll schedule
///
/// Accepts `@every <n>s|m|h`, `@hourly`, `@daily`, and the cron forms
/// `*/N * * * *` / `H/N * * * *` (every N minutes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    /// Expression as written
    pub expression: String,
    /// Time between polls
    pub interval: Duration,
}

impl PollSchedule {
    /// Parses a schedule expression
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSchedule`] when the expression is not
    /// one of the supported forms or yields a zero interval.
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidSchedule(expression.to_string());
        let trimmed = expression.trim();

        let interval = match trimmed {
            "@hourly" => Duration::from_secs(3_600),
            "@daily" => Duration::from_secs(86_400),
            _ if trimmed.starts_with("@every ") => {
                let spec = trimmed.trim_start_matches("@every ").trim();
                let split = spec.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
                let (amount, unit) = spec.split_at(split);
                let amount: u64 = amount.parse().map_err(|_| invalid())?;
                match unit {
                    "s" => Duration::from_secs(amount),
                    "m" => Duration::from_secs(amount * 60),
                    "h" => Duration::from_secs(amount * 3_600),
                    _ => return Err(invalid()),
                }
            }
            _ => {
                let fields: Vec<&str> = trimmed.split_whitespace().collect();
                if fields.len() != 5 || fields[1..].iter().any(|f| *f != "*") {
                    return Err(invalid());
                }
                let minutes = fields[0]
                    .strip_prefix("*/")
                    .or_else(|| fields[0].strip_prefix("H/"))
                    .ok_or_else(invalid)?;
                let minutes: u64 = minutes.parse().map_err(|_| invalid())?;
                Duration::from_secs(minutes * 60)
            }
        };

        if interval.is_zero() {
            return Err(invalid());
        }

        Ok(Self {
            expression: trimmed.to_string(),
            interval,
        })
    }
}

/// Retry policy for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_backoff_ms: u64,

    /// Factor applied to the delay after each attempt
    pub multiplier: f64,

    /// Upper bound for a single delay, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// No retry
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Retries up to `max_attempts` total attempts with default backoff
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the initial backoff
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl super::Validate for RetryPolicy {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetryCount {
                value: self.max_attempts,
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ValidationError::InvalidBackoff(format!(
                "multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ValidationError::InvalidBackoff(format!(
                "max backoff {}ms is below initial backoff {}ms",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Validate;
    use super::*;

    #[test]
    fn test_retry_default_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::attempts(4).with_initial_backoff(Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 1_000,
            multiplier: 10.0,
            max_backoff_ms: 5_000,
        };
        assert_eq!(policy.backoff_for(5), Duration::from_millis(5_000));
    }

    #[test]
    fn test_retry_validation() {
        assert!(matches!(
            RetryPolicy::attempts(0).validate(),
            Err(ValidationError::InvalidRetryCount { value: 0 })
        ));
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ValidationError::InvalidBackoff(_))
        ));
    }

    #[test]
    fn test_trigger_cause_display() {
        let cause = TriggerCause::push("acme/shop", "main", "abc123");
        assert_eq!(cause.to_string(), "push to acme/shop@main (abc123)");
        assert_eq!(TriggerCause::poll("H/5 * * * *").to_string(), "poll (H/5 * * * *)");
        assert_eq!(TriggerCause::manual("").to_string(), "manual");
    }

    #[test]
    fn test_poll_schedule_parse() {
        assert_eq!(
            PollSchedule::parse("@every 90s").unwrap().interval,
            Duration::from_secs(90)
        );
        assert_eq!(
            PollSchedule::parse("H/5 * * * *").unwrap().interval,
            Duration::from_secs(300)
        );
        assert_eq!(
            PollSchedule::parse("@hourly").unwrap().interval,
            Duration::from_secs(3_600)
        );
        assert!(PollSchedule::parse("@every 0m").is_err());
        assert!(PollSchedule::parse("0 3 * * 1").is_err());
        assert!(PollSchedule::parse("@every soon").is_err());
    }

    #[test]
    fn test_concurrency_policy_default_rejects() {
        assert_eq!(ConcurrencyPolicy::default(), ConcurrencyPolicy::Reject);
        let policy: ConcurrencyPolicy = serde_yaml::from_str("queue").unwrap();
        assert_eq!(policy, ConcurrencyPolicy::Queue);
    }
}
