//! Metrics collection
//!
//! Provides counters for run outcomes, per pipeline.

use crate::pipeline::run::Run;
use crate::pipeline::types::{RunStatus, StageStatus};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Accumulated metrics for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Pipeline name
    pub pipeline_name: String,

    /// Finished runs
    pub runs: u64,

    /// Runs that succeeded
    pub succeeded: u64,

    /// Runs that failed
    pub failed: u64,

    /// Runs that were aborted
    pub aborted: u64,

    /// Stages that passed
    pub passed_stages: u64,

    /// Stages that failed
    pub failed_stages: u64,

    /// Stages blocked by a gate
    pub blocked_stages: u64,

    /// Stages that were skipped
    pub skipped_stages: u64,

    /// Duration of the most recent run
    pub last_duration: Duration,
}

impl PipelineMetrics {
    fn add(&mut self, run: &Run) {
        self.runs += 1;
        match run.status() {
            RunStatus::Succeeded => self.succeeded += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::Aborted => self.aborted += 1,
            RunStatus::Pending | RunStatus::Running => {}
        }
        for stage in run.stages() {
            match stage.status {
                StageStatus::Passed => self.passed_stages += 1,
                StageStatus::Failed => self.failed_stages += 1,
                StageStatus::Blocked => self.blocked_stages += 1,
                StageStatus::Skipped => self.skipped_stages += 1,
            }
        }
        self.last_duration = run
            .duration()
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
    }
}

/// Metrics collector for pipeline runs
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<AHashMap<String, PipelineMetrics>>>,
}

impl MetricsCollector {
    /// Creates a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished run
    pub fn record(&self, run: &Run) {
        let mut metrics = self.metrics.write();
        metrics
            .entry(run.pipeline().to_string())
            .or_insert_with(|| PipelineMetrics {
                pipeline_name: run.pipeline().to_string(),
                ..PipelineMetrics::default()
            })
            .add(run);
    }

    /// Gets metrics for a specific pipeline
    #[must_use]
    pub fn get(&self, pipeline_name: &str) -> Option<PipelineMetrics> {
        self.metrics.read().get(pipeline_name).cloned()
    }

    /// Gets all recorded metrics
    #[must_use]
    pub fn get_all(&self) -> Vec<PipelineMetrics> {
        self.metrics.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::options::TriggerCause;
    use crate::pipeline::run::StageResult;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();

        assert!(collector.get("shop").is_none());
        assert!(collector.get_all().is_empty());
    }

    #[test]
    fn test_metrics_collector_record() {
        let collector = MetricsCollector::new();

        let mut run = Run::new(1, "shop", TriggerCause::manual("ops"));
        run.transition(RunStatus::Running).unwrap();
        run.append(StageResult::skipped("Deploy", "not run")).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        collector.record(&run);

        let mut second = Run::new(2, "shop", TriggerCause::manual("ops"));
        second.transition(RunStatus::Aborted).unwrap();
        collector.record(&second);

        let metrics = collector.get("shop").unwrap();
        assert_eq!(metrics.runs, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.aborted, 1);
        assert_eq!(metrics.skipped_stages, 1);
        assert_eq!(collector.get_all().len(), 1);
    }
}
