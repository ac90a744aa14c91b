//! Project creation, status, and label commands.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use pipestate::stage::{Stage, StageStatus};
use pipestate::state::ProjectState;

use super::{CliContext, print_json};

pub fn cmd_init(
    ctx: &CliContext,
    project_id: &str,
    issue: u64,
    title: &str,
    branch: Option<&str>,
    labels: &[String],
) -> Result<()> {
    let labels = (!labels.is_empty()).then(|| labels.to_vec());
    let state = ctx
        .manager()
        .initialize_project(project_id, issue, title, branch, labels)
        .with_context(|| format!("Failed to initialize {}", project_id))?;

    if ctx.json {
        return print_json(&state);
    }
    println!(
        "{} Initialized {} (issue #{}, branch {})",
        console::style("✓").green(),
        state.project_id,
        state.issue_number,
        state.branch
    );
    println!(
        "  State directory: {}",
        ctx.engine.projects_dir.join(&state.project_id).display()
    );
    Ok(())
}

pub fn cmd_status(ctx: &CliContext, project_id: &str) -> Result<()> {
    let state = ctx.manager().get_state(project_id)?;
    if ctx.json {
        return print_json(&state);
    }
    print_state(&state);
    Ok(())
}

pub fn cmd_labels(
    ctx: &CliContext,
    project_id: &str,
    github: &[String],
    custom: &[(String, String)],
) -> Result<()> {
    if github.is_empty() && custom.is_empty() {
        anyhow::bail!("Nothing to update: pass --github and/or --custom");
    }
    let github = (!github.is_empty()).then(|| github.to_vec());
    let custom = (!custom.is_empty()).then(|| custom.iter().cloned().collect::<BTreeMap<_, _>>());

    let state = ctx.manager().update_labels(project_id, github, custom)?;
    if ctx.json {
        return print_json(&state.labels);
    }
    println!("{} Labels updated for {}", console::style("✓").green(), project_id);
    println!("  github: {}", state.labels.github.join(", "));
    for (key, value) in &state.labels.custom {
        println!("  {} = {}", key, value);
    }
    Ok(())
}

fn print_state(state: &ProjectState) {
    println!();
    println!("{}", console::style(format!("Project {}", state.project_id)).bold().cyan());
    println!("{}", "=".repeat(8 + state.project_id.len()));
    println!();
    println!("Title:   {}", state.title);
    println!("Issue:   #{}", state.issue_number);
    println!("Branch:  {}", state.branch);
    println!("Status:  {}", state.status);
    println!("Stage:   {}", state.current_stage);
    println!(
        "Updated: {} (sequence {})",
        state.updated_at.format("%Y-%m-%d %H:%M:%S"),
        state.last_sequence
    );
    println!();

    println!("{:<16} {:<12} {:<8} {:<20} Duration", "Stage", "Status", "Retries", "Agent");
    println!(
        "{:<16} {:<12} {:<8} {:<20} --------",
        "----------------", "------------", "-------", "--------------------"
    );
    for stage in Stage::ALL {
        let status = state.stage_status(stage);
        let record = state.stage(stage);
        let retries = record.map_or(0, |r| r.retry_count);
        let agent = record.and_then(|r| r.agent.as_deref()).unwrap_or("-");
        let duration = record
            .and_then(|r| r.duration_seconds)
            .map_or_else(|| "-".to_string(), |d| format!("{:.1}s", d));
        let status_cell = format!("{:<12}", status.as_str());
        let status_cell = match status {
            StageStatus::Completed => console::style(status_cell).green(),
            StageStatus::Failed => console::style(status_cell).red(),
            StageStatus::InProgress => console::style(status_cell).yellow(),
            _ => console::style(status_cell).dim(),
        };
        println!(
            "{:<16} {} {:<8} {:<20} {}",
            stage.as_str(),
            status_cell,
            retries,
            agent,
            duration
        );
        if status == StageStatus::Failed
            && let Some(error) = record.and_then(|r| r.error.as_deref())
        {
            println!("  {}", console::style(error).dim());
        }
    }
    println!();

    println!("Checkpoints: {}", state.checkpoints.len());
    if let Some(latest) = state.checkpoints.back() {
        println!(
            "  Latest: {} ({}, {}, {})",
            latest.id,
            latest.stage,
            latest.status,
            latest.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let recovery = &state.recovery_info;
    println!();
    println!("Recovery:");
    println!("  Can resume: {}", recovery.can_resume);
    if let Some(stage) = recovery.resume_from_stage {
        println!("  Resume from: {}", stage);
    }
    if let Some(checkpoint) = &recovery.last_successful_checkpoint {
        println!("  Last successful checkpoint: {}", checkpoint);
    }

    let metrics = &state.metrics;
    println!();
    println!("Metrics:");
    println!("  Total duration: {:.1}s", metrics.total_duration_seconds);
    println!("  Agent invocations: {}", metrics.agent_invocations);
    println!("  Retries: {}", metrics.retry_count);
    println!("  Artifacts: {}", metrics.artifacts_generated);
    println!("  Dead letters: {}", metrics.dead_letters);
    if !state.labels.github.is_empty() {
        println!();
        println!("Labels: {}", state.labels.github.join(", "));
    }
    println!();
}
