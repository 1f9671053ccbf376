//! CLI for stagegate
//!
//! - `run`: Execute a pipeline once and report the outcome
//! - `poll`: Run a pipeline on its poll schedule until interrupted
//! - `validate`: Check a pipeline definition without running it
//! - `init`: Print the reference pipeline as YAML
//! - `completions`: Generate shell completions

pub mod completions;
mod run;
mod validate;

use anyhow::Result;
use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

/// CLI arguments for stagegate
#[derive(Parser, Debug)]
#[command(name = "stagegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application config file
    #[arg(short, long, global = true, env = "STAGEGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline once
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Commit to build (starts a push-triggered run)
        #[arg(long)]
        commit: Option<String>,
        /// Branch of the commit
        #[arg(long, default_value = "main")]
        branch: String,
        /// Print the final run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a pipeline on its poll schedule
    Poll {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Schedule overriding the pipeline's own (`@every 5m`, `H/5 * * * *`)
        #[arg(short, long)]
        schedule: Option<String>,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline file to validate
        file: PathBuf,
    },

    /// Print the reference pipeline
    Init {
        #[command(flatten)]
        reference: ReferenceArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Which pipeline to run
#[derive(ClapArgs, Debug, Clone)]
struct PipelineArgs {
    /// Pipeline file (the reference pipeline when omitted)
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[command(flatten)]
    reference: ReferenceArgs,
}

/// Parameters of the reference pipeline
#[derive(ClapArgs, Debug, Clone)]
struct ReferenceArgs {
    /// Pipeline name
    #[arg(long, default_value = "app")]
    name: String,
    /// Static-analysis project key
    #[arg(long, default_value = "app")]
    project: String,
    /// Image repository
    #[arg(long, default_value = "app")]
    image: String,
    /// Deploy host
    #[arg(long, default_value = "localhost")]
    host: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

/// Parse and execute CLI arguments
pub fn run() -> Result<ExitCode> {
    let args = Args::parse();
    let config = run::load_config(args.config.as_deref())?;

    match args.command {
        Command::Run {
            pipeline,
            commit,
            branch,
            json,
        } => {
            let pipeline = run::resolve_pipeline(&pipeline)?;
            let cause = run::cause_for(&config, commit, branch);
            let succeeded = run::run_once(&config, pipeline, cause, json)?;
            return Ok(if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::Poll { pipeline, schedule } => {
            let pipeline = run::resolve_pipeline(&pipeline)?;
            run::poll(&config, pipeline, schedule.as_deref())?;
        }
        Command::Validate { file } => {
            let report = validate::validate_pipeline(&file)?;
            println!("{report}");
        }
        Command::Init { reference } => {
            let pipeline = reference_pipeline(&reference);
            print!("{}", pipeline.to_yaml()?);
        }
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{completions}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn reference_pipeline(reference: &ReferenceArgs) -> stagegate::Pipeline {
    stagegate::Pipeline::reference(
        reference.name.as_str(),
        reference.project.as_str(),
        reference.image.as_str(),
        reference.host.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_parse_run_with_commit() {
        let args = Args::try_parse_from([
            "stagegate", "run", "--name", "shop", "--commit", "abc123", "--json",
        ])
        .unwrap();
        match args.command {
            Command::Run {
                pipeline,
                commit,
                json,
                ..
            } => {
                assert_eq!(pipeline.reference.name, "shop");
                assert!(pipeline.file.is_none());
                assert_eq!(commit.as_deref(), Some("abc123"));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_reference_pipeline_is_valid() {
        use stagegate::Validate;

        let reference = ReferenceArgs {
            name: "shop".to_string(),
            project: "shop".to_string(),
            image: "acme/shop".to_string(),
            host: "10.0.0.5".to_string(),
        };
        assert!(reference_pipeline(&reference).validate().is_ok());
    }
}
