//! Stage lifecycle commands: start, complete, fail, checkpoint.

use anyhow::{Context, Result};

use pipestate::checkpoint::{CheckpointStatus, NewCheckpoint};
use pipestate::dead_letter::{ErrorInfo, FailureContext};
use pipestate::stage::Stage;

use super::{CliContext, print_json};

pub fn cmd_start(
    ctx: &CliContext,
    project_id: &str,
    stage: Stage,
    agent: &str,
    max_retries: Option<u32>,
) -> Result<()> {
    let manager = ctx.manager();
    let state = match max_retries {
        Some(ceiling) => manager.start_stage_with_ceiling(project_id, stage, agent, ceiling)?,
        None => manager.start_stage(project_id, stage, agent)?,
    };

    if ctx.json {
        return print_json(&state);
    }
    let attempt = state.stage(stage).map_or(1, |r| r.retry_count + 1);
    println!(
        "{} Started {} with {} (attempt {})",
        console::style("▶").cyan(),
        stage,
        agent,
        attempt
    );
    Ok(())
}

pub fn cmd_complete(
    ctx: &CliContext,
    project_id: &str,
    stage: Stage,
    artifacts: &[String],
    create_checkpoint: bool,
) -> Result<()> {
    let state = ctx
        .manager()
        .complete_stage(project_id, stage, artifacts, create_checkpoint)?;

    if ctx.json {
        return print_json(&state);
    }
    let duration = state
        .stage(stage)
        .and_then(|r| r.duration_seconds)
        .unwrap_or_default();
    println!(
        "{} Completed {} in {:.1}s ({} artifacts)",
        console::style("✓").green(),
        stage,
        duration,
        artifacts.len()
    );
    if create_checkpoint && let Some(checkpoint) = state.checkpoints.back() {
        println!("  Checkpoint: {}", checkpoint.id);
    }
    Ok(())
}

/// Error and context flags for `fail`.
pub struct FailureArgs<'a> {
    pub error_type: &'a str,
    pub message: &'a str,
    pub exit_code: Option<i32>,
    pub context: Option<&'a str>,
    pub request: Option<&'a str>,
}

impl FailureArgs<'_> {
    fn error(&self) -> ErrorInfo {
        let error = ErrorInfo::new(self.error_type, self.message);
        match self.exit_code {
            Some(code) => error.with_exit_code(code),
            None => error,
        }
    }

    fn context(&self) -> Result<FailureContext> {
        let mut context: FailureContext = match self.context {
            Some(raw) => serde_json::from_str(raw).context("--context must be a JSON object")?,
            None => FailureContext::default(),
        };
        if let Some(raw) = self.request {
            context.request = Some(serde_json::from_str(raw).context("--request must be valid JSON")?);
        }
        Ok(context)
    }
}

pub fn cmd_fail(
    ctx: &CliContext,
    project_id: &str,
    stage: Stage,
    agent: &str,
    failure: FailureArgs<'_>,
) -> Result<()> {
    let context = failure.context()?;
    let dead_letter = ctx
        .manager()
        .add_dead_letter(project_id, stage, agent, failure.error(), context)?;

    if ctx.json {
        return print_json(&dead_letter);
    }
    println!(
        "{} {} failed on attempt {}: {}",
        console::style("✗").red(),
        stage,
        dead_letter.attempt_number,
        dead_letter.error.message
    );
    println!("  Dead letter: {}", dead_letter.id);
    Ok(())
}

pub fn cmd_checkpoint(
    ctx: &CliContext,
    project_id: &str,
    stage: Stage,
    artifacts: &[String],
    status: CheckpointStatus,
    dead_letter: Option<&str>,
) -> Result<()> {
    let mut request = NewCheckpoint::new(stage, status, artifacts.to_vec());
    if let Some(id) = dead_letter {
        request = request.after_failure(id);
    }
    let checkpoint = ctx.manager().create_checkpoint_with(project_id, request)?;

    if ctx.json {
        return print_json(&checkpoint);
    }
    println!(
        "{} Checkpoint {} ({}, {})",
        console::style("✓").green(),
        checkpoint.id,
        checkpoint.stage,
        checkpoint.status
    );
    Ok(())
}
