//! stagegate - run gated build-to-deploy pipelines
//!
//! ## Commands
//!
//! - `stagegate run` - Execute a pipeline once (exit code 0 only on success)
//! - `stagegate poll` - Run a pipeline on its poll schedule until Ctrl-C
//! - `stagegate validate` - Check a pipeline definition
//! - `stagegate init` - Print the reference pipeline as YAML
//! - `stagegate completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Write the reference pipeline and check it
//! stagegate init --name shop --image acme/shop --host 10.0.0.5 > pipeline.yaml
//! stagegate validate pipeline.yaml
//!
//! # Build a commit
//! stagegate --config stagegate.toml run -f pipeline.yaml --commit 9f2c1e7
//!
//! # Generate shell completions
//! stagegate completions bash > /etc/bash_completion.d/stagegate
//! ```
//!
//! Set `STAGEGATE_LOG` to a tracing filter (`stagegate=debug`) for more output.

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    if std::env::var("STAGEGATE_DEBUG").is_ok() {
        stagegate::infrastructure::init_logging("debug");
    }

    match cli::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("STAGEGATE_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
