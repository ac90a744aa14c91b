//! Transition log and dead-letter commands.

use anyhow::Result;

use pipestate::dead_letter::{DeadLetterFilter, RecoveryResult};
use pipestate::stage::Stage;
use pipestate::transitions::{EventType, TransitionEntry, TransitionFilter};

use super::{CliContext, print_json};

pub fn cmd_transitions(
    ctx: &CliContext,
    project_id: &str,
    stage: Option<Stage>,
    event: Option<EventType>,
    limit: Option<usize>,
) -> Result<()> {
    let manager = ctx.manager();
    let filter = TransitionFilter {
        stage,
        event_type: event,
    };
    let entries: Vec<TransitionEntry> = match limit {
        Some(limit) => manager.get_recent_transitions(project_id, filter, limit)?,
        None => manager
            .get_transitions(project_id, filter)?
            .collect::<pipestate::Result<_>>()?,
    };

    if ctx.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No transitions recorded for {}", project_id);
        return Ok(());
    }

    println!();
    println!(
        "{:<6} {:<20} {:<20} {:<16} Detail",
        "Seq", "Time", "Event", "Stage"
    );
    println!(
        "{:<6} {:<20} {:<20} {:<16} ------",
        "------", "--------------------", "--------------------", "----------------"
    );
    for entry in &entries {
        println!(
            "{:<6} {:<20} {:<20} {:<16} {}",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.event_type.as_str(),
            entry.stage.map_or("-", |s| s.as_str()),
            console::style(detail(entry)).dim()
        );
    }
    println!();
    Ok(())
}

fn detail(entry: &TransitionEntry) -> String {
    if let Some(error) = &entry.error {
        return format!("{}: {}", error.error_type, error.message);
    }
    let mut parts = Vec::new();
    if let Some(agent) = &entry.agent {
        parts.push(format!("agent={}", agent));
    }
    if let Some(checkpoint) = &entry.checkpoint_id {
        parts.push(format!("checkpoint={}", checkpoint));
    }
    if !entry.artifacts.is_empty() {
        parts.push(format!("artifacts={}", entry.artifacts.len()));
    }
    parts.join(" ")
}

pub fn cmd_dead_letters(
    ctx: &CliContext,
    project_id: &str,
    stage: Option<Stage>,
    agent: Option<&str>,
    unrecovered_only: bool,
) -> Result<()> {
    let filter = DeadLetterFilter {
        stage,
        agent: agent.map(str::to_string),
        unrecovered_only,
    };
    let entries = ctx.manager().query_dead_letters(project_id, &filter)?;

    if ctx.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No dead letters for {}", project_id);
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<16} {:<8} {:<10} Error",
        "ID", "Stage", "Attempt", "Recovery"
    );
    println!(
        "{:<38} {:<16} {:<8} {:<10} -----",
        "--------------------------------------", "----------------", "-------", "----------"
    );
    for entry in &entries {
        let recovery = if entry.recovery_attempted {
            entry.recovery_result.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<38} {:<16} {:<8} {:<10} {}: {}",
            entry.id,
            entry.stage.as_str(),
            entry.attempt_number,
            recovery,
            entry.error.error_type,
            entry.error.message
        );
    }
    println!();
    let unrecovered = entries.iter().filter(|e| e.is_unrecovered()).count();
    println!("{} dead letters ({} unrecovered)", entries.len(), unrecovered);
    Ok(())
}

pub fn cmd_resolve(
    ctx: &CliContext,
    project_id: &str,
    dead_letter_id: &str,
    result: RecoveryResult,
) -> Result<()> {
    let entry = ctx
        .manager()
        .mark_dead_letter_recovery(project_id, dead_letter_id, result)?;

    if ctx.json {
        return print_json(&entry);
    }
    println!(
        "{} Dead letter {} marked {}",
        console::style("✓").green(),
        entry.id,
        entry.recovery_result
    );
    Ok(())
}

/// Count a replay and print the stored request so the caller can resend it.
pub fn cmd_replay(ctx: &CliContext, project_id: &str, dead_letter_id: &str) -> Result<()> {
    let entry = ctx
        .manager()
        .record_dead_letter_replay(project_id, dead_letter_id)?;

    match &entry.context.request {
        Some(request) => print_json(request),
        None => {
            if ctx.json {
                print_json(&serde_json::Value::Null)
            } else {
                eprintln!(
                    "{} Dead letter {} has no stored request (replay {})",
                    console::style("⚠").yellow(),
                    entry.id,
                    entry.replay_count
                );
                Ok(())
            }
        }
    }
}
