use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flakescope::config::FlakescopeConfig;
use flakescope::flaky::{ExecutionRecord, ExecutionStatus, FlakinessReport, NewExecution};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "flakescope",
    about = "Flaky test detection and root-cause ranking",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + flakiness tracker)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Analyse a JSON array of executions without storing anything
    Analyze {
        /// Input file
        #[arg(long)]
        input: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Record one execution and re-analyse its test case
    Record {
        /// Test case identifier
        #[arg(long)]
        test_case: String,

        /// passed or failed
        #[arg(long)]
        status: ExecutionStatus,

        /// Execution time in milliseconds
        #[arg(long)]
        time_ms: u64,

        /// DOM stability score (0-100)
        #[arg(long)]
        dom_stability: Option<f64>,

        /// Wait condition failures during the run
        #[arg(long)]
        wait_failures: Option<u32>,

        /// Network calls observed during the run
        #[arg(long)]
        network_calls: Option<u32>,

        /// Error message of a failed run
        #[arg(long)]
        error: Option<String>,
    },

    /// List recorded executions of a test case, newest first
    Executions {
        /// Test case identifier
        #[arg(long)]
        test_case: String,
    },

    /// Inspect and resolve detected flaky tests
    Flaky {
        #[command(subcommand)]
        action: FlakyAction,
    },

    /// Show dashboard statistics
    Stats,
}

#[derive(Subcommand)]
enum FlakyAction {
    /// List unresolved flaky tests, highest score first
    List,

    /// Show one flaky test with its root causes
    Show {
        /// Flaky test id
        #[arg(long)]
        id: uuid::Uuid,
    },

    /// Mark a flaky test as resolved
    Resolve {
        /// Flaky test id
        #[arg(long)]
        id: uuid::Uuid,
    },
}

fn init_tracing(config: &FlakescopeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(report: &FlakinessReport) {
    println!("\n=== flakescope Analysis ===");
    println!("Flaky:           {}", if report.is_flaky { "YES" } else { "no" });
    println!("Flakiness score: {}", report.flakiness_score);
    println!("Failure rate:    {:.1}%", report.failure_rate);
    println!("Timing variance: {:.1}%", report.timing_variance);
    println!("DOM stability:   {:.1}%", report.dom_stability);
    if report.root_causes.is_empty() {
        println!("\nNo root causes identified.");
    } else {
        println!("\n{:<12} | {:<10} | Description", "Cause", "Confidence");
        println!("{:-<12}-|-{:-<10}-|-{:-<40}", "", "", "");
        for cause in &report.root_causes {
            println!(
                "{:<12} | {:<10} | {}",
                cause.kind,
                format!("{}%", cause.confidence),
                cause.description
            );
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let resolved = FlakescopeConfig::resolve(cli.config.as_deref())?;
    init_tracing(&resolved.config);
    resolved.log();
    let mut config = resolved.config;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting flakescope daemon");
            flakescope::serve(&config).await?;
        }
        Commands::Analyze { input, json } => {
            let content = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let executions: Vec<ExecutionRecord> = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse executions from {}", input.display()))?;
            executions
                .iter()
                .try_for_each(ExecutionRecord::validate)
                .with_context(|| format!("invalid execution in {}", input.display()))?;
            tracing::info!(executions = executions.len(), "Analysing execution history");

            let report = flakescope::flaky::analyze(&executions);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Record {
            test_case,
            status,
            time_ms,
            dom_stability,
            wait_failures,
            network_calls,
            error,
        } => {
            let tracker = flakescope::open_tracker(&config)?;
            let outcome = tracker
                .record_execution(NewExecution {
                    test_case_id: test_case,
                    status,
                    execution_time_ms: time_ms,
                    dom_stability_score: dom_stability,
                    wait_condition_failures: wait_failures,
                    network_call_count: network_calls,
                    error_message: error,
                    executed_at: None,
                })
                .await?;

            println!(
                "Recorded execution #{} for '{}' ({}).",
                outcome.execution.id.unwrap_or_default(),
                outcome.execution.test_case_id,
                outcome.execution.status
            );
            match (&outcome.report, &outcome.flaky_test) {
                (None, _) => println!(
                    "Not analysed yet: needs {} executions.",
                    tracker.min_executions()
                ),
                (Some(_), Some(flaky)) => {
                    println!("Flaky test detected (id {}).", flaky.id);
                }
                (Some(_), None) => println!("Not flaky."),
            }
            if let Some(report) = &outcome.report {
                print_report(report);
            }
        }
        Commands::Executions { test_case } => {
            let tracker = flakescope::open_tracker(&config)?;
            let executions = tracker.executions_for(&test_case).await?;
            if executions.is_empty() {
                println!("No executions recorded for '{}'.", test_case);
            } else {
                println!("{:<32} | {:<8} | {:>10} | Error", "Executed at", "Status", "Time (ms)");
                println!("{:-<32}-|-{:-<8}-|-{:->10}-|-{:-<20}", "", "", "", "");
                for e in executions {
                    println!(
                        "{:<32} | {:<8} | {:>10} | {}",
                        e.executed_at.to_rfc3339(),
                        e.status,
                        e.execution_time_ms,
                        e.error_message.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Flaky { action } => {
            let tracker = flakescope::open_tracker(&config)?;
            match action {
                FlakyAction::List => {
                    let list = tracker.list_flaky().await?;
                    if list.is_empty() {
                        println!("No unresolved flaky tests.");
                    } else {
                        println!(
                            "{:<36} | {:<24} | {:>5} | {:>9} | Top cause",
                            "Id", "Test case", "Score", "Runs"
                        );
                        println!("{:-<36}-|-{:-<24}-|-{:->5}-|-{:->9}-|-{:-<12}", "", "", "", "", "");
                        for f in list {
                            println!(
                                "{:<36} | {:<24} | {:>5} | {:>9} | {}",
                                f.id,
                                f.test_case_id,
                                f.flakiness_score,
                                format!("{}/{}", f.failed_runs, f.total_runs),
                                f.root_causes.first().map(|c| c.kind.as_str()).unwrap_or("-")
                            );
                        }
                    }
                }
                FlakyAction::Show { id } => {
                    let record = tracker.get_flaky(id).await?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                FlakyAction::Resolve { id } => {
                    let record = tracker.resolve(id).await?;
                    println!("Flaky test '{}' marked resolved.", record.test_case_id);
                }
            }
        }
        Commands::Stats => {
            let tracker = flakescope::open_tracker(&config)?;
            let stats = tracker.dashboard_stats().await?;
            println!("Total tests:      {}", stats.total_tests);
            println!("Flaky tests:      {}", stats.flaky_test_count);
            println!("Flaky percentage: {}%", stats.flaky_percentage);
        }
    }

    Ok(())
}
