//! `stagegate run` and `stagegate poll` - Execute pipelines
//!
//! ## Usage
//!
//! ```bash
//! stagegate run --file pipeline.yaml --commit 9f2c1e7
//! stagegate poll --file pipeline.yaml --schedule "@every 5m"
//! ```
//!
//! `run` exits with 0 only when the run succeeded.

use anyhow::{Context, Result};
use stagegate::engine::{PipelineEngine, PollTrigger};
use stagegate::infrastructure::{Config, ToolAdapters, init_logging};
use stagegate::pipeline::{ConcurrencyPolicy, Pipeline, PollSchedule, Run, TriggerCause};
use std::path::Path;

use super::PipelineArgs;

/// Loads the config file (defaults without one) and applies env overrides
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    let config = config.with_env_overrides();
    init_logging(&config.log_level);
    Ok(config)
}

/// The pipeline from a file, or the reference pipeline
pub fn resolve_pipeline(args: &PipelineArgs) -> Result<Pipeline> {
    match &args.file {
        Some(file) => Pipeline::load(file)
            .with_context(|| format!("Failed to load pipeline: {}", file.display())),
        None => Ok(super::reference_pipeline(&args.reference)),
    }
}

/// A push cause when a commit is given, a manual one otherwise
pub fn cause_for(config: &Config, commit: Option<String>, branch: String) -> TriggerCause {
    match commit {
        Some(commit) => TriggerCause::push(config.repo.clone(), branch, commit),
        None => TriggerCause::manual(std::env::var("USER").unwrap_or_default()),
    }
}

fn engine(config: &Config, mut pipeline: Pipeline) -> Result<PipelineEngine> {
    if let Some(policy) = config.concurrency {
        pipeline.concurrency = policy;
    }
    let tools = ToolAdapters::from_config(config, config.credential_resolver())?;
    Ok(PipelineEngine::builder(pipeline, tools)
        .default_timeout(config.default_timeout())
        .notify_timeout(config.notify_timeout())
        .repo(config.repo.clone())
        .build()?)
}

fn print_run(run: &Run) {
    println!("{}", run.summary());
    for stage in run.stages() {
        println!("  {stage}");
    }
}

/// Executes one run; returns whether it succeeded
pub fn run_once(config: &Config, pipeline: Pipeline, cause: TriggerCause, json: bool) -> Result<bool> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let run = runtime.block_on(async {
        let engine = engine(config, pipeline)?;
        Ok::<_, anyhow::Error>(engine.run_to_completion(cause).await?)
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(run.status().is_success())
}

/// Runs the pipeline on its schedule until Ctrl-C
///
/// Triggers arriving while a run is active are queued unless the config
/// sets a concurrency policy.
pub fn poll(config: &Config, mut pipeline: Pipeline, schedule: Option<&str>) -> Result<()> {
    let expression = schedule
        .map(ToString::to_string)
        .or_else(|| pipeline.poll.clone())
        .context("No poll schedule: set `poll` in the pipeline or pass --schedule")?;
    let schedule = PollSchedule::parse(&expression)?;
    pipeline.concurrency = ConcurrencyPolicy::Queue;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    runtime.block_on(async {
        let engine = engine(config, pipeline)?;
        tracing::info!(
            pipeline = %engine.pipeline().name,
            schedule = %schedule.expression,
            "Polling"
        );

        tokio::select! {
            started = engine.listen(PollTrigger::new(schedule)) => {
                tracing::info!(started, "Poll trigger stopped");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
            }
        }

        if let Some(active) = engine.active_run() {
            engine.abort_run(active)?;
            let run = engine.wait_for(active).await?;
            print_run(&run);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_for_commit() {
        let config = Config {
            repo: "acme/shop".to_string(),
            ..Config::default()
        };
        assert_eq!(
            cause_for(&config, Some("abc".to_string()), "main".to_string()),
            TriggerCause::push("acme/shop", "main", "abc")
        );
        assert!(matches!(
            cause_for(&config, None, "main".to_string()),
            TriggerCause::Manual { .. }
        ));
    }

    #[test]
    fn test_resolve_pipeline_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        let reference = Pipeline::reference("shop", "shop", "acme/shop", "10.0.0.5");
        std::fs::write(&path, reference.to_yaml().unwrap()).unwrap();

        let args = PipelineArgs {
            file: Some(path),
            reference: super::super::ReferenceArgs {
                name: "ignored".to_string(),
                project: "x".to_string(),
                image: "x".to_string(),
                host: "x".to_string(),
            },
        };
        assert_eq!(resolve_pipeline(&args).unwrap(), reference);
    }
}
