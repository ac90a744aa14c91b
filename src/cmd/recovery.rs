//! Recovery and integrity commands.

use anyhow::Result;

use super::{CliContext, print_json};

pub fn cmd_recover(ctx: &CliContext, project_id: &str, dry_run: bool) -> Result<()> {
    let manager = ctx.manager();
    let state = if dry_run {
        manager.reconstruct_state(project_id)?
    } else {
        manager.recover_project(project_id)?
    };

    if ctx.json {
        return print_json(&state);
    }
    let verb = if dry_run { "Reconstructed" } else { "Recovered" };
    println!(
        "{} {} {} from {} transitions",
        console::style("✓").green(),
        verb,
        project_id,
        state.last_sequence
    );
    println!("  Status: {} at {}", state.status, state.current_stage);
    if let Some(stage) = state.recovery_info.resume_from_stage {
        println!(
            "  Resume from: {}{}",
            stage,
            if state.recovery_info.can_resume { "" } else { " (retries exhausted)" }
        );
    }
    if dry_run {
        println!("  {}", console::style("Dry run: state.json was not written").dim());
    }
    Ok(())
}

/// Exits non-zero when any warning is found.
pub fn cmd_verify(ctx: &CliContext, project_id: &str) -> Result<()> {
    let warnings = ctx.manager().check_integrity(project_id)?;

    if ctx.json {
        let rendered: Vec<String> = warnings.iter().map(ToString::to_string).collect();
        print_json(&serde_json::json!({
            "project_id": project_id,
            "clean": warnings.is_empty(),
            "warnings": rendered,
        }))?;
    } else if warnings.is_empty() {
        println!("{} {} is consistent", console::style("✓").green(), project_id);
    } else {
        println!();
        for warning in &warnings {
            println!("  {} {}", console::style("⚠").yellow(), warning);
        }
        println!();
    }

    if !warnings.is_empty() {
        anyhow::bail!("{} integrity warning(s) for {}", warnings.len(), project_id);
    }
    Ok(())
}
