#![forbid(unsafe_code)]

//! Operator CLI over the relationship consistency engine.
//!
//! # Responsibility
//! - Open the SQLite document store and run one pass against one scope.
//! - Print the pass result as pretty JSON on stdout.
//!
//! # Exit codes
//! - `0` success, `1` failure, `2` repair finished but findings remain.

use clap::{Parser, Subcommand};
use rosterfix_core::db::open_db;
use rosterfix_core::{
    default_log_level, init_logging, Diagnoser, EngineConfig, Recoverer, Repairer,
    SqliteDocumentRepository, Verifier,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const EXIT_RESIDUAL_FINDINGS: u8 = 2;

#[derive(Parser)]
#[command(name = "rosterfix")]
#[command(about = "Diagnose, repair and recover container/member relationships")]
#[command(version)]
struct Cli {
    /// SQLite document store file.
    #[arg(long, global = true, default_value = "rosterfix.sqlite3")]
    db: PathBuf,
    /// Scope (tenant) to operate on.
    #[arg(long, global = true)]
    scope: Option<String>,
    /// JSON engine config; defaults apply to every missing field.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enables rolling file logs in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reports drift without writing.
    Diagnose,
    /// Diagnoses, repairs and diagnoses again.
    Repair {
        /// Only print what would be repaired.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Recreates relations from fact evidence, then verifies coverage.
    Recover,
    /// Reports fact coverage statistics.
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(message) => {
            log::error!("event=cli_run module=cli status=error error={message}");
            eprintln!("rosterfix: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, String> {
    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        let log_dir = std::path::absolute(log_dir)
            .map_err(|err| format!("cannot resolve log dir {}: {err}", log_dir.display()))?;
        init_logging(level, &log_dir.to_string_lossy())?;
    }

    let scope = cli
        .scope
        .as_deref()
        .ok_or_else(|| "--scope is required".to_string())?;
    let config = load_config(cli.config.as_deref())?;
    let conn = open_db(&cli.db).map_err(|err| err.to_string())?;
    let repo = SqliteDocumentRepository::try_new(&conn)
        .map_err(|err| err.to_string())?
        .with_max_batch_ops(config.batch.max_ops);

    match &cli.command {
        Commands::Diagnose => {
            let diagnosis = Diagnoser::new(&repo, config)
                .diagnose(scope)
                .map_err(|err| err.to_string())?;
            print_json(&diagnosis)?;
        }
        Commands::Repair { dry_run: true } => {
            let diagnosis = Diagnoser::new(&repo, config)
                .diagnose(scope)
                .map_err(|err| err.to_string())?;
            print_json(&diagnosis)?;
        }
        Commands::Repair { dry_run: false } => {
            let outcome = Repairer::new(&repo, config)
                .run_to_fixed_point(scope)
                .map_err(|err| match err.completed() {
                    Some(completed) => format!("{err} (completed: {completed:?})"),
                    None => err.to_string(),
                })?;
            print_json(&outcome)?;
            if !outcome.residual.is_clean() {
                return Ok(ExitCode::from(EXIT_RESIDUAL_FINDINGS));
            }
        }
        Commands::Recover => {
            let (result, report) = Recoverer::new(&repo, config)
                .recover_and_verify(scope)
                .map_err(|err| err.to_string())?;
            print_json(&serde_json::json!({ "recovery": result, "verification": report }))?;
        }
        Commands::Verify => {
            let report = Verifier::new(&repo, config)
                .verify(scope)
                .map_err(|err| err.to_string())?;
            print_json(&report)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("cannot read config {}: {err}", path.display()))?;
    EngineConfig::from_json_str(&raw).map_err(|err| err.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}
