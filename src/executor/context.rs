//! Per-run execution context

use crate::infrastructure::adapter::SourceRef;
use crate::pipeline::run::{Run, RunId};

/// State handed from stage to stage within one run
///
/// Steps read the references produced by earlier steps (the artifact, the
/// image, the pushed reference) from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Run identifier
    pub run_id: RunId,

    /// Run number
    pub run_number: u64,

    /// Pipeline name
    pub pipeline: String,

    /// Revision being built
    pub source: SourceRef,

    /// Artifact produced by the build step
    pub artifact: Option<String>,

    /// Image produced by the image build step
    pub image: Option<String>,

    /// Reference pushed to the registry
    pub pushed: Option<String>,
}

impl RunContext {
    /// Context for a new run; poll and manual runs build `default_repo`
    #[must_use]
    pub fn for_run(run: &Run, default_repo: &str) -> Self {
        Self {
            run_id: run.id(),
            run_number: run.number(),
            pipeline: run.pipeline().to_string(),
            source: SourceRef::from_cause(run.cause(), default_repo),
            artifact: None,
            image: None,
            pushed: None,
        }
    }

    /// Image to deploy: the pushed reference when there is one
    #[must_use]
    pub fn deployable_image(&self) -> Option<&str> {
        self.pushed.as_deref().or(self.image.as_deref())
    }

    /// Fills `{commit}`, `{branch}` and `{run}` in an image tag
    ///
    /// Runs without a known commit use `run-<number>` for `{commit}`.
    #[must_use]
    pub fn render_tag(&self, template: &str) -> String {
        let commit = if self.source.commit.is_empty() {
            format!("run-{}", self.run_number)
        } else {
            self.source.commit.chars().take(12).collect()
        };
        template
            .replace("{commit}", &commit)
            .replace("{branch}", &self.source.branch.replace('/', "-"))
            .replace("{run}", &self.run_number.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::options::TriggerCause;

    #[test]
    fn test_render_tag() {
        let run = Run::new(
            7,
            "shop",
            TriggerCause::push("acme/shop", "feature/x", "0123456789abcdef"),
        );
        let ctx = RunContext::for_run(&run, "unused");
        assert_eq!(
            ctx.render_tag("acme/shop:{branch}-{commit}-{run}"),
            "acme/shop:feature-x-0123456789ab-7"
        );
    }

    #[test]
    fn test_render_tag_without_commit() {
        let run = Run::new(3, "shop", TriggerCause::manual("ops"));
        let ctx = RunContext::for_run(&run, "acme/shop");
        assert_eq!(ctx.render_tag("shop:{commit}"), "shop:run-3");
        assert_eq!(ctx.source.repo, "acme/shop");
    }

    #[test]
    fn test_deployable_image_prefers_pushed() {
        let run = Run::new(1, "shop", TriggerCause::manual(""));
        let mut ctx = RunContext::for_run(&run, "acme/shop");
        assert_eq!(ctx.deployable_image(), None);
        ctx.image = Some("shop:1".to_string());
        assert_eq!(ctx.deployable_image(), Some("shop:1"));
        ctx.pushed = Some("docker.io/shop:1@sha256:ab".to_string());
        assert_eq!(ctx.deployable_image(), Some("docker.io/shop:1@sha256:ab"));
    }
}
