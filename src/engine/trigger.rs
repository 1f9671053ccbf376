//! Trigger sources
//!
//! A trigger source yields the causes that start runs: poll timer ticks and
//! push events delivered by a webhook receiver.

use crate::pipeline::errors::PipelineError;
use crate::pipeline::options::{PollSchedule, TriggerCause};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Produces trigger causes
#[async_trait]
pub trait TriggerSource: Send {
    /// Waits for the next cause; `None` when the source is exhausted
    async fn next_cause(&mut self) -> Option<TriggerCause>;
}

/// Fires on a fixed poll schedule
///
/// The first tick comes one interval after the first call. Ticks missed
/// while a run was being started are dropped, not replayed.
pub struct PollTrigger {
    schedule: PollSchedule,
    interval: Option<Interval>,
}

impl PollTrigger {
    /// Creates a trigger for a schedule
    pub fn new(schedule: PollSchedule) -> Self {
        Self {
            schedule,
            interval: None,
        }
    }

    /// The schedule this trigger follows
    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }
}

#[async_trait]
impl TriggerSource for PollTrigger {
    async fn next_cause(&mut self) -> Option<TriggerCause> {
        let period = self.schedule.interval;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;
        tracing::debug!(schedule = %self.schedule.expression, "Poll trigger fired");
        Some(TriggerCause::poll(self.schedule.expression.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct GithubPush {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: GithubRepository,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    full_name: String,
}

/// Parses a GitHub-style push webhook payload
///
/// Returns `None` for tag pushes and branch deletions.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] when the payload is not a push event.
pub fn parse_push_event(body: &str) -> Result<Option<TriggerCause>, PipelineError> {
    let event: GithubPush = serde_json::from_str(body)
        .map_err(|e| PipelineError::Config(format!("invalid push payload: {e}")))?;
    if event.deleted {
        return Ok(None);
    }
    let Some(branch) = event.git_ref.strip_prefix("refs/heads/") else {
        return Ok(None);
    };
    Ok(Some(TriggerCause::push(
        event.repository.full_name,
        branch,
        event.after,
    )))
}

/// Sending half of a push trigger, handed to the webhook receiver
#[derive(Debug, Clone)]
pub struct PushSender {
    tx: mpsc::Sender<TriggerCause>,
    branches: Vec<String>,
}

impl PushSender {
    /// Forwards a push cause unless its branch is filtered out
    ///
    /// Returns whether the cause was forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the trigger was dropped.
    pub async fn send(&self, cause: TriggerCause) -> Result<bool, PipelineError> {
        if let TriggerCause::Push { branch, .. } = &cause
            && !self.branches.is_empty()
            && !self.branches.iter().any(|b| b == branch)
        {
            tracing::debug!(branch = %branch, "Ignoring push to unwatched branch");
            return Ok(false);
        }
        self.tx
            .send(cause)
            .await
            .map_err(|_| PipelineError::Config("push trigger closed".to_string()))?;
        Ok(true)
    }

    /// Parses a webhook payload and forwards the push it describes
    ///
    /// # Errors
    ///
    /// Returns the errors of [`parse_push_event`] and [`PushSender::send`].
    pub async fn send_webhook(&self, body: &str) -> Result<bool, PipelineError> {
        match parse_push_event(body)? {
            Some(cause) => self.send(cause).await,
            None => Ok(false),
        }
    }
}

/// Receives push events from a [`PushSender`]
pub struct PushTrigger {
    rx: mpsc::Receiver<TriggerCause>,
}

impl PushTrigger {
    /// Creates a connected sender and trigger
    ///
    /// With a non-empty `branches` list only pushes to those branches start
    /// runs.
    pub fn channel(buffer: usize, branches: Vec<String>) -> (PushSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (PushSender { tx, branches }, Self { rx })
    }
}

#[async_trait]
impl TriggerSource for PushTrigger {
    async fn next_cause(&mut self) -> Option<TriggerCause> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "after": "9f2c1e7",
        "repository": {"full_name": "acme/shop"},
        "pusher": {"name": "dev"}
    }"#;

    #[test]
    fn test_parse_push_event() {
        let cause = parse_push_event(PUSH).unwrap().unwrap();
        assert_eq!(cause, TriggerCause::push("acme/shop", "main", "9f2c1e7"));
    }

    #[test]
    fn test_tag_push_and_deletion_are_ignored() {
        let tag = PUSH.replace("refs/heads/main", "refs/tags/v1.0");
        assert_eq!(parse_push_event(&tag).unwrap(), None);

        let deleted = PUSH.replace("\"pusher\"", "\"deleted\": true, \"pusher\"");
        assert_eq!(parse_push_event(&deleted).unwrap(), None);

        assert!(parse_push_event("{\"zen\": \"ping\"}").is_err());
    }

    #[tokio::test]
    async fn test_push_trigger_filters_branches() {
        let (sender, mut trigger) = PushTrigger::channel(4, vec!["main".to_string()]);

        assert!(!sender
            .send(TriggerCause::push("acme/shop", "feature", "1"))
            .await
            .unwrap());
        assert!(sender.send_webhook(PUSH).await.unwrap());
        drop(sender);

        let cause = trigger.next_cause().await.unwrap();
        assert!(matches!(cause, TriggerCause::Push { ref branch, .. } if branch == "main"));
        assert_eq!(trigger.next_cause().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_trigger_fires_on_interval() {
        let mut trigger = PollTrigger::new(PollSchedule::parse("@every 30s").unwrap());
        let start = Instant::now();

        let cause = trigger.next_cause().await.unwrap();
        assert_eq!(cause, TriggerCause::poll("@every 30s"));
        assert!(start.elapsed() >= Duration::from_secs(30));

        trigger.next_cause().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
