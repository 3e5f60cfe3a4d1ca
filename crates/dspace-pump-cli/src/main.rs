//! dspace-pump CLI - resumable DSpace 5 to DSpace 7 migration.

mod sample;

use clap::{Parser, Subcommand};
use dspace_pump::{
    Config, ConsistencyReport, MigrateError, MigrationResult, Orchestrator, StageStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "dspace-pump")]
#[command(about = "Resumable DSpace 5 to DSpace 7 migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override a configuration value, e.g. `--set migration.workers=2` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a migration
    Run {
        /// Continue from existing checkpoints
        #[arg(long)]
        resume: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Read legacy tables from migration.snapshot_dir
        #[arg(long)]
        snapshots: bool,
    },

    /// Resume a previously interrupted migration
    Resume {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Dump legacy tables to migration.snapshot_dir
    Export {
        /// Table to export (repeatable); all tables when omitted
        #[arg(long = "table")]
        tables: Vec<String>,
    },

    /// Row counts of the destination and both legacy databases
    Status,

    /// Compare legacy and destination row counts
    Verify,

    /// Test the backend login and database connections
    HealthCheck,

    /// Write a sample configuration file
    Init {
        /// Output path for configuration file [default: config.yaml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Init doesn't need an existing config
    if let Commands::Init { output, force } = &cli.command {
        let output = output.clone().unwrap_or_else(|| PathBuf::from("config.yaml"));
        sample::write_sample(&output, *force)?;
        println!("Wrote sample configuration to {}", output.display());
        return Ok(());
    }

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load_with_overrides(&cli.config, &cli.overrides)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above
        Commands::Run {
            resume,
            workers,
            snapshots,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if snapshots {
                config.migration.use_snapshots = true;
            }
            config.validate()?;
            migrate(config, resume, cli.output_json).await?;
        }

        Commands::Resume { workers } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            config.validate()?;
            migrate(config, true, cli.output_json).await?;
        }

        Commands::Export { tables } => {
            let orchestrator = Orchestrator::new(config);
            let exported = orchestrator.export(&tables).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&exported)?);
            } else {
                println!("Exported tables:");
                for (table, rows) in &exported {
                    println!("  {:<40} {:>10} rows", table, rows);
                }
            }
        }

        Commands::Status => {
            let orchestrator = Orchestrator::new(config);
            let counts = orchestrator.status().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                for (db, tables) in &counts {
                    println!("{}:", db);
                    for (table, rows) in tables {
                        println!("  {:<40} {:>10}", table, rows);
                    }
                }
            }
        }

        Commands::Verify => {
            let orchestrator = Orchestrator::new(config);
            let report = orchestrator.verify().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_consistency(&report);
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config);
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for check in &result.checks {
                    println!(
                        "  {}: {} ({}ms)",
                        check.target,
                        if check.ok { "OK" } else { "FAILED" },
                        check.latency_ms
                    );
                    if let Some(ref err) = check.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

async fn migrate(config: Config, resume: bool, output_json: bool) -> Result<(), MigrateError> {
    let cancel_token = setup_signal_handler();
    let orchestrator = Orchestrator::new(config).with_resume(resume);
    let result = orchestrator.run(cancel_token).await?;

    if output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    match result.failed_stages.first() {
        Some(stage) => Err(MigrateError::stage(
            stage.clone(),
            "stage failed, fix the cause and run `resume`",
        )),
        None => Ok(()),
    }
}

fn print_summary(result: &MigrationResult) {
    println!("\nMigration {}!", result.status);
    println!("  Duration: {:.2}s", result.duration_seconds);
    for stage in &result.stages {
        let status = match stage.status {
            StageStatus::Completed => "done",
            StageStatus::AlreadyDone => "done earlier",
            StageStatus::Failed => "FAILED",
        };
        println!(
            "  {:<18} {:<12} imported {}/{} (skipped {}, failed {}, critical {})",
            stage.stage,
            status,
            stage.totals.imported,
            stage.totals.expected,
            stage.totals.skipped,
            stage.totals.failed,
            stage.totals.critical
        );
    }
    println!(
        "  Requests: {} GET, {} write",
        result.requests.gets, result.requests.writes
    );
    if !result.failed_stages.is_empty() {
        println!("  Failed stages: {:?}", result.failed_stages);
    }
    if let Some(report) = &result.consistency {
        println!();
        print_consistency(report);
    }
}

fn print_consistency(report: &ConsistencyReport) {
    println!("Consistency report:");
    for check in &report.tables {
        println!(
            "  {} {:<16} legacy={:<10} destination={}",
            if check.matches() { "OK " } else { "!! " },
            check.table,
            check.legacy,
            check.destination
        );
    }
    for diff in report.divergent() {
        println!(
            "  !! {}.{}: {} only in legacy {:?}, {} only in destination {:?}",
            diff.table,
            diff.column,
            diff.only_legacy,
            diff.legacy_sample,
            diff.only_destination,
            diff.destination_sample
        );
    }
    println!(
        "\n  Overall: {}",
        if report.is_consistent() { "CONSISTENT" } else { "MISMATCH" }
    );
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. The running stage
/// finishes; no further stage starts.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
            sigint.recv().await;
            eprintln!("\nReceived SIGINT. Stopping after the current stage...");
            token_int.cancel();
        }
    });

    tokio::spawn(async move {
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            eprintln!("\nReceived SIGTERM. Stopping after the current stage...");
            token_term.cancel();
        }
    });

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current stage...");
            token.cancel();
        }
    });

    cancel_token
}
