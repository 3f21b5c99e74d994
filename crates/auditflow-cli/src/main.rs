// crates/auditflow-cli/src/main.rs
// ============================================================================
// Module: Auditflow CLI Entry Point
// Description: Command dispatcher for running, resuming, and purging audit
//              pipeline runs.
// Purpose: Provide the CLI surface named in spec §6 with correct exit-code
//          mapping, backed by the SQLite recorder and filesystem payload
//          store.
// Dependencies: auditflow-cli, clap, tracing, tracing-subscriber
// ============================================================================

//! ## Overview
//! `run`/`resume` wire a [`PluginLoader`](auditflow_cli::PluginLoader) into
//! the orchestrator; this binary ships only
//! [`UnconfiguredPluginLoader`](auditflow_cli::UnconfiguredPluginLoader), so
//! those subcommands report a clear "no plugins configured" failure rather
//! than silently doing nothing — concrete plugins are supplied by a
//! deployment-specific binary linking this crate's library. `purge` needs
//! no plugins and runs for real against the audit database and payload
//! store.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use auditflow_cli::CliError;
use auditflow_cli::PluginLoader;
use auditflow_cli::UnconfiguredPluginLoader;
use auditflow_cli::exit_code_for_error;
use auditflow_cli::exit_code_for_summary;
use auditflow_cli::load_orchestrator_config;
use auditflow_cli::open_audit_store;
use auditflow_cli::open_payload_store;
use auditflow_core::identifiers::RunId;
use auditflow_core::model::ExportStatus;
use auditflow_core::orchestrator::Orchestrator;
use auditflow_core::payload::PayloadStore;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::retention::RetentionPurgeManager;
use auditflow_core::row_processor::ProcessorConfig;
use auditflow_core::time::Timestamp;
use clap::Args;
use clap::Parser;
use clap::Subcommand;

/// Auditflow command-line entry point.
#[derive(Parser, Debug)]
#[command(name = "auditflow", disable_help_subcommand = true, arg_required_else_help = true)]
struct Cli {
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts a new run, or resumes an interrupted/failed one with
    /// `--resume`.
    Run(RunArgs),
    /// Purges expired content-addressed payloads past the retention window.
    Purge(PurgeArgs),
}

/// Minimum arguments named in spec §6: a config path, an audit database, a
/// payload store directory, and an optional run id to resume.
#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the pipeline configuration file (JSON).
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
    /// Path to the SQLite audit database file.
    #[arg(long, value_name = "PATH")]
    audit_db: PathBuf,
    /// Directory the content-addressed payload store is rooted at.
    #[arg(long, value_name = "DIR")]
    payload_dir: PathBuf,
    /// Resumes the named run instead of starting a new one.
    #[arg(long, value_name = "RUN_ID")]
    resume: Option<u64>,
}

/// Arguments for the retention purge command.
#[derive(Args, Debug)]
struct PurgeArgs {
    /// Path to the SQLite audit database file.
    #[arg(long, value_name = "PATH")]
    audit_db: PathBuf,
    /// Directory the content-addressed payload store is rooted at.
    #[arg(long, value_name = "DIR")]
    payload_dir: PathBuf,
    /// Age, in days, beyond which a completed run's payloads are eligible
    /// for purge. Falls back to the `RETENTION_DAYS` environment variable,
    /// then to the orchestrator default, when omitted.
    #[arg(long, value_name = "DAYS")]
    retention_days: Option<u32>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => command_run(&args),
        Command::Purge(args) => command_purge(&args),
    }
}

fn command_run(args: &RunArgs) -> ExitCode {
    match run_or_resume(args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            exit_code_for_error()
        }
    }
}

fn run_or_resume(args: &RunArgs) -> Result<ExitCode, CliError> {
    let config = load_orchestrator_config(&args.config)?;
    let mut recorder = open_audit_store(&args.audit_db)?;
    let payload_store = open_payload_store(&args.payload_dir)?;

    let loader = UnconfiguredPluginLoader;
    let mut bundle = loader.load(&args.config)?;
    let processor_config = ProcessorConfig::default();
    let mut orchestrator = Orchestrator::new(config);

    let summary = if let Some(raw_run_id) = args.resume {
        let run_id = RunId::from_raw(raw_run_id).ok_or(CliError::InvalidResumeId)?;
        tracing::info!(run_id = raw_run_id, "resuming run");
        orchestrator.resume(run_id, bundle.specs.clone(), &mut bundle.as_run_plugins(), &processor_config, &mut recorder, &payload_store, None)?
    } else {
        tracing::info!("starting run");
        orchestrator.run(bundle.specs.clone(), &mut bundle.as_run_plugins(), &processor_config, &mut recorder, &payload_store, None)?
    };

    let export_status = recorder.get_run(summary.run_id).map_or(ExportStatus::NotConfigured, |run| run.export_status);
    tracing::info!(
        run_id = summary.run_id.get(),
        status = ?summary.status,
        rows_seen = summary.rows_seen,
        rows_completed = summary.rows_completed,
        rows_quarantined = summary.rows_quarantined,
        rows_failed = summary.rows_failed,
        "run finished"
    );
    Ok(exit_code_for_summary(&summary, export_status))
}

fn command_purge(args: &PurgeArgs) -> ExitCode {
    match purge(args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "purge failed");
            exit_code_for_error()
        }
    }
}

fn purge(args: &PurgeArgs) -> Result<ExitCode, CliError> {
    let mut recorder = open_audit_store(&args.audit_db)?;
    let payload_store = open_payload_store(&args.payload_dir)?;
    let retention_days = args.retention_days.or_else(retention_days_from_env).unwrap_or(90);

    let manager = RetentionPurgeManager::new();
    let now = Timestamp::now();
    let refs = manager.find_expired_payload_refs(&recorder, retention_days, now);
    let hashes: Vec<_> = refs.iter().map(|r| r.hash.clone()).collect();
    let present_before: BTreeSet<_> = hashes.iter().filter(|h| payload_store.exists(h).unwrap_or(false)).cloned().collect();
    let result = manager.purge_payloads(&payload_store, &hashes, now, Timestamp::now());
    let failed: BTreeSet<_> = result.failed_refs.iter().cloned().collect();

    // A ref that existed before this pass and is not in failed_refs was
    // actually deleted by purge_payloads above.
    let affected_runs: BTreeSet<_> =
        refs.iter().filter(|r| present_before.contains(&r.hash) && !failed.contains(&r.hash)).map(|r| r.run_id).collect();
    for run_id in affected_runs {
        manager.update_grade_after_purge(&mut recorder, run_id)?;
    }

    tracing::info!(
        deleted = result.deleted_count,
        skipped = result.skipped_count,
        failed = result.failed_refs.len(),
        bytes_freed = result.bytes_freed,
        "retention purge complete"
    );
    if result.failed_refs.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(auditflow_cli::EXIT_PARTIAL))
    }
}

fn retention_days_from_env() -> Option<u32> {
    std::env::var("RETENTION_DAYS").ok().and_then(|value| value.parse().ok())
}
