//! CLI for route-signal scenarios
//!
//! Run `route-signal --help` for usage information.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use route_signal::scenario::StepReport;
use route_signal::{RouteId, Scenario, ScenarioReport};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "route-signal")]
#[command(about = "Replay navigation scenarios through the route cancellation coordinator")]
#[command(version)]
struct Cli {
    /// Output format: json, text
    #[arg(short, long, default_value = "text", env = "ROUTE_SIGNAL_FORMAT")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "ROUTE_SIGNAL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every step of a scenario and report results and cancellations
    Run {
        /// Path to the scenario YAML file
        file: PathBuf,
    },

    /// Check that a scenario's route tree is valid
    Validate {
        /// Path to the scenario YAML file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("route_signal=debug,info")
    } else {
        EnvFilter::new("route_signal=info,warn")
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run { file } => {
            let scenario = Scenario::load(&file)
                .with_context(|| format!("Failed to load scenario {}", file.display()))?;
            tracing::info!(
                file = %file.display(),
                routes = scenario.routes.len(),
                steps = scenario.steps.len(),
                "Running scenario"
            );
            let report = scenario.run().await?;

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_report(&report),
            }
        }
        Commands::Validate { file } => {
            let scenario = Scenario::load(&file)
                .with_context(|| format!("Failed to load scenario {}", file.display()))?;
            let routes = scenario.validate()?;

            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "valid": true, "routes": routes })
                ),
                OutputFormat::Text => println!("✅ {routes} routes, no duplicate ids"),
            }
        }
    }

    Ok(())
}

fn print_report(report: &ScenarioReport) {
    for step in &report.steps {
        print_step(step);
    }

    println!();
    if report.cancellations.is_empty() {
        println!("No operations were cancelled");
    } else {
        println!("Cancellations:");
        for event in &report.cancellations {
            println!("  ✗ {} ({})", event.route_id, event.reason);
        }
    }
}

fn print_step(step: &StepReport) {
    println!("[{}] {}", step.step, step.action);
    if !step.executed.is_empty() {
        let executed: Vec<&str> = step.executed.iter().map(RouteId::as_str).collect();
        println!("    executed: {}", executed.join(", "));
    }
    for (route_id, value) in &step.results {
        println!("    {route_id} => {value}");
    }
    if let Some(error) = &step.error {
        println!("    ❌ {error}");
    }
    let active: Vec<&str> = step.active.iter().map(RouteId::as_str).collect();
    println!("    active: [{}]", active.join(", "));
}
