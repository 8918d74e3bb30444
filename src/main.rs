//! Environment backup/restore tool
//!
//! Backs up the database and file tree of one environment into a single
//! archive, and restores such an archive into any environment.

// envbackup/src/main.rs
mod archive;
mod backend;
mod config;
mod database;
mod engine;
mod errors;
mod preflight;
mod storage;
mod transfer;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use backend::{FileTransport, StandardBackend};
use config::AppConfig;
use database::ProcessJobService;
use engine::Engine;

#[derive(Parser)]
#[command(name = "envbackup")]
#[command(about = "Environment database and file backup/restore tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.json; environment variables are used when it does not exist
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up one environment
    Backup {
        #[arg(long)]
        env: String,

        /// Defaults to the current local time, e.g. 2024-01-15-093000
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Restore a backup of one environment into another (or the same) environment
    Restore {
        /// Environment the backup was taken from
        #[arg(long)]
        env: String,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        dest_env: String,
    },

    /// Check tools and bucket access without changing anything
    Preflight,
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_app(cli).await {
        Ok(()) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Priority: RUST_LOG env var > verbose flag > default (info)
fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn default_run_id() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H%M%S").to_string()
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;
    let store = storage::connect(&app_config.storage)
        .await
        .context("Failed to set up object storage")?;

    if let Commands::Preflight = cli.command {
        info!("🔎 Running preflight checks");
        let problems = preflight::run_checks(&app_config, store.as_ref(), preflight::on_path).await;
        if !problems.is_empty() {
            anyhow::bail!("Preflight found {} problem(s):\n  {}", problems.len(), problems.join("\n  "));
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping after the current operation (press Ctrl-C again to exit now)");
        on_interrupt.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("❌ Interrupted again, exiting without cleanup.");
            std::process::exit(130);
        }
    });

    let jobs = Arc::new(ProcessJobService::new(app_config.temp_root.join("envbackup_jobs")));
    let files = FileTransport::from_config(
        app_config.file_transport,
        Arc::clone(&store),
        app_config.max_concurrency,
        cancel.clone(),
    );
    let backend = StandardBackend::new(jobs, store, files, app_config.polling, cancel.clone())
        .create_database_if_missing(app_config.create_database_if_missing);
    let engine = Engine::new(
        Arc::new(backend),
        app_config.registry.clone(),
        app_config.temp_root.clone(),
    )
    .with_cancellation(cancel);

    match cli.command {
        Commands::Backup { env, run_id } => {
            let run_id = run_id.unwrap_or_else(default_run_id);
            let report = engine
                .perform_backup(&env, &run_id)
                .await
                .with_context(|| format!("Backup of {} failed", env))?;
            println!(
                "Backup {} of {} stored at {} ({} files)",
                report.run_id, report.environment, report.archive, report.files
            );
        }
        Commands::Restore {
            env,
            run_id,
            dest_env,
        } => {
            let report = engine
                .perform_restore(&env, &run_id, &dest_env)
                .await
                .with_context(|| format!("Restore of {} into {} failed", env, dest_env))?;
            println!(
                "Restored {} from {} into {} ({} files)",
                report.archive, report.source_env, report.dest_env, report.files
            );
        }
        Commands::Preflight => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_id_is_key_safe() {
        let id = default_run_id();
        assert_eq!(id.len(), "2024-01-15-093000".len());
        engine::validate_run_id(&id).unwrap();
    }

    #[test]
    fn cli_parses_restore() {
        let cli = Cli::try_parse_from([
            "envbackup",
            "-v",
            "restore",
            "--env",
            "staging",
            "--run-id",
            "2024-01-15-001",
            "--dest-env",
            "production",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.config, PathBuf::from("config.json"));
        match cli.command {
            Commands::Restore { env, run_id, dest_env } => {
                assert_eq!(
                    (env.as_str(), run_id.as_str(), dest_env.as_str()),
                    ("staging", "2024-01-15-001", "production")
                );
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn backup_run_id_is_optional() {
        let cli = Cli::try_parse_from(["envbackup", "backup", "--env", "staging"]).unwrap();
        assert!(matches!(cli.command, Commands::Backup { run_id: None, .. }));
    }
}
