//! Configuration view and validation commands: `pipestate config`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use pipestate::config::{CONFIG_FILE, ENV_LOCK_TIMEOUT_SECS, ENV_PROJECTS_DIR, PipestateToml};
use pipestate::logging::default_log_dir;

use super::super::ConfigCommands;
use super::{CliContext, print_json};

pub fn cmd_config(ctx: &CliContext, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = ctx
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            if ctx.json {
                return print_json(&ctx.toml);
            }
            println!();
            println!("Pipestate Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}; using defaults", CONFIG_FILE, config_path.display());
            }
            println!();
            print_toml(&ctx.toml);

            println!("Effective values (with env/CLI overrides):");
            let engine = &ctx.engine;
            println!("  projects_dir = \"{}\"", engine.projects_dir.display());
            println!("  lock_timeout = {}s", engine.lock_timeout.as_secs());
            println!();
            println!(
                "{}",
                console::style(format!(
                    "Environment: {} and {} override the file",
                    ENV_PROJECTS_DIR, ENV_LOCK_TIMEOUT_SECS
                ))
                .dim()
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = PipestateToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => init_config(&config_path)?,
    }

    Ok(())
}

fn print_toml(toml: &PipestateToml) {
    println!("[storage]");
    println!("  projects_dir = \"{}\"", toml.storage.projects_dir.display());
    println!();
    println!("[locks]");
    println!("  timeout_secs = {}", toml.locks.timeout_secs);
    println!();
    println!("[checkpoints]");
    println!("  max_retained = {}", toml.checkpoints.max_retained);
    println!();
    println!("[retries]");
    println!("  max_stage_retries = {}", toml.retries.max_stage_retries);
    println!();
    println!("[integrity]");
    println!("  window_secs = {}", toml.integrity.window_secs);
    println!();
    println!("[logging]");
    println!(
        "  level = \"{}\"",
        toml.logging.level.as_deref().unwrap_or("info")
    );
    let log_dir = toml.logging.dir.clone().unwrap_or_else(default_log_dir);
    println!("  dir = \"{}\"", log_dir.display());
    println!("  json = {}", toml.logging.json);
    println!();
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("{} already exists at {}", CONFIG_FILE, config_path.display());
        println!("Delete it first if you want to recreate it.");
        return Ok(());
    }
    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    PipestateToml::default().save(config_path)?;

    println!("Created {} at {}", CONFIG_FILE, config_path.display());
    println!();
    println!("You can now customize:");
    println!("  - [storage] projects_dir");
    println!("  - [locks] timeout_secs");
    println!("  - [retries] max_stage_retries");
    println!();
    Ok(())
}
