//! `stagegate validate` - Check a pipeline definition
//!
//! Parses the YAML definition and runs every load-time check (names, stage
//! order, step inputs, gate policies, poll schedule) without starting a run.
//!
//! ## Usage
//!
//! ```bash
//! stagegate validate pipeline.yaml
//! # Exit code 0: definition is valid
//! # Exit code 1: the first problem found is printed
//! ```

use anyhow::{Context, Result};
use stagegate::pipeline::Pipeline;
use std::fmt::Write;
use std::path::Path;

/// Validates a pipeline file and describes its execution order
pub fn validate_pipeline(file: &Path) -> Result<String> {
    tracing::debug!(file = %file.display(), "Validating pipeline");

    if !file.exists() {
        anyhow::bail!("Pipeline file not found: {}", file.display());
    }

    let pipeline = Pipeline::load(file)
        .with_context(|| format!("Pipeline validation failed for: {}", file.display()))?;

    let mut report = format!("{pipeline}\n");
    for stage in pipeline.execution_order() {
        let _ = write!(report, "  {}. {}", stage.position.unwrap_or_default(), stage.name);
        if stage.gate.is_gated() {
            let _ = write!(report, " [{} gate]", stage.gate);
        }
        if stage.retry.max_attempts > 1 {
            let _ = write!(report, " (up to {} attempts)", stage.retry.max_attempts);
        }
        report.push('\n');
    }
    if let Some(schedule) = pipeline.poll_schedule()? {
        let _ = writeln!(
            report,
            "  polls every {}s ({})",
            schedule.interval.as_secs(),
            schedule.expression
        );
    }

    tracing::info!(file = %file.display(), "Pipeline validation successful");
    Ok(report.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
name: shop
poll: "H/5 * * * *"
stages:
  - name: Build
    steps:
      - uses: build
    retry:
      max_attempts: 2
  - name: Docker Build
    steps:
      - uses: image_build
        tag: "acme/shop:{commit}"
  - name: Trivy Scan
    gate: security
    steps:
      - uses: vulnerability_scan
policies:
  security:
    thresholds:
      - "criticalCVEs <= 0"
"#;

    #[test]
    fn test_validate_pipeline_valid_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("pipeline.yaml");
        fs::write(&file_path, PIPELINE).unwrap();

        let report = validate_pipeline(&file_path).unwrap();
        assert!(report.contains("1. Build (up to 2 attempts)"));
        assert!(report.contains("3. Trivy Scan [security gate]"));
        assert!(report.contains("polls every 300s"));
    }

    #[test]
    fn test_validate_pipeline_missing_policy() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("pipeline.yaml");
        let without_policy = PIPELINE.split("policies:").next().unwrap();
        fs::write(&file_path, without_policy).unwrap();

        let error = validate_pipeline(&file_path).unwrap_err();
        assert!(format!("{error:#}").contains("Trivy Scan"));
    }

    #[test]
    fn test_validate_pipeline_nonexistent_file() {
        let result = validate_pipeline(Path::new("/nonexistent/pipeline.yaml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
