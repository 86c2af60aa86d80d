//! Covenant CLI - inspect, plan and simulate resource contracts.
//!
//! Provides commands for contract status, batch planning, child allocation,
//! governed batch simulation and configuration inspection.

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use covenant_core::config::GovernanceConfig;
use covenant_core::telemetry::init_logging;

use commands::{allocate, config, plan, simulate, status};
use output::OutputFormat;

/// Covenant - resource contract governance
#[derive(Parser)]
#[command(
    name = "covenant",
    author = "Aezi <aezi.zhu@icloud.com>",
    version,
    about = "Covenant - resource contract governance",
    long_about = "CLI tool for inspecting resource contracts, planning batches and simulating governed execution.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "COVENANT_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a contract, apply consumption and show its status
    Status(status::StatusArgs),

    /// Show the batch size planned for a utilization level
    Plan(plan::PlanArgs),

    /// Allocate child budgets under a root contract
    Allocate(allocate::AllocateArgs),

    /// Run a simulated batch under a root contract
    Simulate(simulate::SimulateArgs),

    /// Configuration inspection
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

fn load_config(path: Option<&PathBuf>) -> Result<GovernanceConfig> {
    match path {
        Some(path) => GovernanceConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => GovernanceConfig::load().context("Failed to load configuration"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let governance = load_config(cli.config.as_ref())?;
    init_logging(&governance.telemetry.logging)?;
    debug!(
        config = ?cli.config,
        max_workers = governance.scheduler.max_workers,
        reserve_buffer = governance.conservation.reserve_buffer,
        "Configuration resolved"
    );

    let format = cli.output;
    match cli.command {
        Commands::Status(args) => status::execute(args, &governance, format),
        Commands::Plan(args) => plan::execute(args, &governance, format),
        Commands::Allocate(args) => allocate::execute(args, &governance, format),
        Commands::Simulate(args) => simulate::execute(args, &governance, format).await,
        Commands::Config(cmd) => config::execute(cmd, &governance, format),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
