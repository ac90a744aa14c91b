use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pipestate::checkpoint::CheckpointStatus;
use pipestate::dead_letter::RecoveryResult;
use pipestate::errors::StateError;
use pipestate::stage::Stage;
use pipestate::transitions::EventType;

mod cmd;

/// Exit status for retryable failures (EX_TEMPFAIL).
const EXIT_TEMPFAIL: u8 = 75;

#[derive(Parser)]
#[command(name = "pipestate")]
#[command(version, about = "Crash-safe state tracking for multi-stage agent pipelines")]
pub struct Cli {
    /// Path to pipestate.toml (defaults to ./pipestate.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding one subdirectory per project. Overrides config and environment.
    #[arg(long, global = true)]
    pub projects_dir: Option<PathBuf>,

    /// Seconds to wait for file locks before giving up
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Directory for log files
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new project
    Init {
        project_id: String,
        /// Issue the project was opened from
        #[arg(long)]
        issue: u64,
        #[arg(long)]
        title: String,
        /// Defaults to somas/<project_id>
        #[arg(long)]
        branch: Option<String>,
        /// GitHub label (repeatable); defaults to the standard project labels
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Start or retry a stage
    Start {
        project_id: String,
        stage: Stage,
        #[arg(long)]
        agent: String,
        /// Retry ceiling for this call (defaults to retries.max_stage_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Complete the running stage
    Complete {
        project_id: String,
        stage: Stage,
        /// Produced artifact path (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
        /// Do not record a checkpoint
        #[arg(long)]
        no_checkpoint: bool,
    },
    /// Record a failed attempt and its dead letter
    Fail {
        project_id: String,
        stage: Stage,
        #[arg(long)]
        agent: String,
        #[arg(long = "type")]
        error_type: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        exit_code: Option<i32>,
        /// Failure context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Agent request as JSON, kept for replay
        #[arg(long)]
        request: Option<String>,
    },
    /// Record a checkpoint
    Checkpoint {
        project_id: String,
        stage: Stage,
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
        /// Record a partial instead of a successful checkpoint
        #[arg(long)]
        partial: bool,
        /// Dead letter this checkpoint attempt follows
        #[arg(long)]
        dead_letter: Option<String>,
    },
    /// Show project state
    Status { project_id: String },
    /// Show the transition log
    Transitions {
        project_id: String,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        event: Option<EventType>,
        /// Only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List dead letters
    DeadLetters {
        project_id: String,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        agent: Option<String>,
        /// Only entries without a successful recovery
        #[arg(long)]
        unrecovered: bool,
    },
    /// Record the result of a recovery attempt
    Resolve {
        project_id: String,
        dead_letter_id: String,
        /// pending, success, or failed
        #[arg(long, default_value = "success")]
        result: RecoveryResult,
    },
    /// Count a replay of a dead letter and print its request
    Replay {
        project_id: String,
        dead_letter_id: String,
    },
    /// Update labels
    Labels {
        project_id: String,
        /// Replace GitHub labels (repeatable)
        #[arg(long = "github")]
        github: Vec<String>,
        /// Merge a custom label as key=value (repeatable)
        #[arg(long = "custom", value_parser = cmd::parse_key_value)]
        custom: Vec<(String, String)>,
    },
    /// Rebuild state.json from the transition log
    Recover {
        project_id: String,
        /// Show the rebuilt state without writing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Check state, dead letters, and log for skew
    Verify { project_id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default pipestate.toml
    Init,
}

fn run(cli: &Cli) -> Result<()> {
    let ctx = cmd::CliContext::from_cli(cli)?;

    match &cli.command {
        Commands::Init {
            project_id,
            issue,
            title,
            branch,
            labels,
        } => cmd::cmd_init(&ctx, project_id, *issue, title, branch.as_deref(), labels)?,
        Commands::Start {
            project_id,
            stage,
            agent,
            max_retries,
        } => cmd::cmd_start(&ctx, project_id, *stage, agent, *max_retries)?,
        Commands::Complete {
            project_id,
            stage,
            artifacts,
            no_checkpoint,
        } => cmd::cmd_complete(&ctx, project_id, *stage, artifacts, !*no_checkpoint)?,
        Commands::Fail {
            project_id,
            stage,
            agent,
            error_type,
            message,
            exit_code,
            context,
            request,
        } => cmd::cmd_fail(
            &ctx,
            project_id,
            *stage,
            agent,
            cmd::FailureArgs {
                error_type,
                message,
                exit_code: *exit_code,
                context: context.as_deref(),
                request: request.as_deref(),
            },
        )?,
        Commands::Checkpoint {
            project_id,
            stage,
            artifacts,
            partial,
            dead_letter,
        } => {
            let status = if *partial {
                CheckpointStatus::Partial
            } else {
                CheckpointStatus::Success
            };
            cmd::cmd_checkpoint(&ctx, project_id, *stage, artifacts, status, dead_letter.as_deref())?
        }
        Commands::Status { project_id } => cmd::cmd_status(&ctx, project_id)?,
        Commands::Transitions {
            project_id,
            stage,
            event,
            limit,
        } => cmd::cmd_transitions(&ctx, project_id, *stage, *event, *limit)?,
        Commands::DeadLetters {
            project_id,
            stage,
            agent,
            unrecovered,
        } => cmd::cmd_dead_letters(&ctx, project_id, *stage, agent.as_deref(), *unrecovered)?,
        Commands::Resolve {
            project_id,
            dead_letter_id,
            result,
        } => cmd::cmd_resolve(&ctx, project_id, dead_letter_id, *result)?,
        Commands::Replay {
            project_id,
            dead_letter_id,
        } => cmd::cmd_replay(&ctx, project_id, dead_letter_id)?,
        Commands::Labels {
            project_id,
            github,
            custom,
        } => cmd::cmd_labels(&ctx, project_id, github, custom)?,
        Commands::Recover {
            project_id,
            dry_run,
        } => cmd::cmd_recover(&ctx, project_id, *dry_run)?,
        Commands::Verify { project_id } => cmd::cmd_verify(&ctx, project_id)?,
        Commands::Config { command } => cmd::cmd_config(&ctx, command.clone())?,
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let retryable = err
                .chain()
                .filter_map(|cause| cause.downcast_ref::<StateError>())
                .any(StateError::is_retryable);
            if retryable {
                ExitCode::from(EXIT_TEMPFAIL)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
