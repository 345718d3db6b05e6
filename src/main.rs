//! MariaDB/MySQL backup tool
//!
//! Provides CLI interface for backup and artifact verification

// dumpvault/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use backup::guard::{CleanupRegistry, spawn_signal_listener};
use config::{AppConfig, ENCRYPTION_KEY_ENV, load_backup_config_from_json};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(code) => code,
        Err(e) if errors::is_cancellation(&e) => {
            warn!("Operation cancelled: {:#}", e);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "backup" => run_backup(args.get(2).map(String::as_str)).await,
        "2" | "verify" => {
            let artifact = args.get(2).context("Usage: dumpvault verify <artifact>")?;
            let key = env::var(ENCRYPTION_KEY_ENV).ok();
            let report = backup::verify::verify_artifact(&PathBuf::from(artifact), key.as_deref())
                .with_context(|| format!("Verification of {} failed", artifact))?;
            if report.completed {
                info!("✅ Artifact is complete.");
                Ok(ExitCode::SUCCESS)
            } else {
                warn!("Artifact decodes but the dump did not complete.");
                Ok(ExitCode::FAILURE)
            }
        }
        _ => {
            error!("❌ Invalid choice. Please enter '1' (backup) or '2' (verify).");
            anyhow::bail!("Invalid operation choice");
        }
    }
}

async fn run_backup(mode_override: Option<&str>) -> Result<ExitCode> {
    let config_path = AppConfig::default_path();
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;
    info!("Loaded configuration from {}", app_config.config_path.display());
    let backup_config = load_backup_config_from_json(&app_config.raw_json_config, mode_override)
        .context("Failed to load backup configuration from JSON")?;

    info!("🚀 Starting Backup Process...");
    let cancel = CancellationToken::new();
    let registry = CleanupRegistry::new();
    let listener = spawn_signal_listener(cancel.clone(), registry.clone());

    let outcome = backup::run_backup_flow(&backup_config, cancel, registry).await;
    // the run unwound by itself, so the forced exit after the grace period is no longer needed
    listener.abort();

    let result = outcome.context("Backup process failed")?;
    if result.cancelled {
        warn!("Backup cancelled: {}", result.summary_line());
        return Ok(ExitCode::SUCCESS);
    }
    if result.failed_backups > 0 || !result.errors.is_empty() {
        error!("❌ Backup finished with failures: {}", result.summary_line());
        for e in &result.errors {
            error!("  {}", e);
        }
        return Ok(ExitCode::FAILURE);
    }
    info!("✅ Operation completed successfully: {}", result.summary_line());
    Ok(ExitCode::SUCCESS)
}

/// Prompts user to select an operation
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Verify Backup Artifact (or type 'verify')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
