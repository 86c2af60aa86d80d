//! Configuration inspection commands.
//!
//! Configuration is read from `--config` or `COVENANT__*` environment
//! variables; these commands show what was resolved.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use covenant_core::config::GovernanceConfig;
use covenant_core::contracts::ContractMode;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,

    /// Show the effective defaults for each contract mode
    Modes,

    /// Validate the configuration and report success
    Validate,
}

#[derive(Debug, Serialize, Tabled)]
struct ModeRow {
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Tokens")]
    tokens: String,
    #[tabled(rename = "Iterations")]
    iterations: String,
    #[tabled(rename = "Overridden")]
    overridden: bool,
}

pub fn execute(cmd: ConfigCommands, governance: &GovernanceConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Table => {
                let scheduler = &governance.scheduler;
                output::print_header("Conservation");
                output::print_detail(
                    "reserve_buffer",
                    output::percent(governance.conservation.reserve_buffer),
                );
                output::print_detail("strategy", governance.conservation.strategy);
                output::print_detail(
                    "clamp_child_duration",
                    governance.conservation.clamp_child_duration,
                );

                output::print_header("Scheduler");
                output::print_detail("max_workers", scheduler.max_workers);
                output::print_detail("max_batch_size", scheduler.max_batch_size);
                output::print_detail(
                    "high_utilization_threshold",
                    scheduler.high_utilization_threshold,
                );
                output::print_detail(
                    "medium_utilization_threshold",
                    scheduler.medium_utilization_threshold,
                );
                output::print_detail("item_timeout", format!("{:?}", scheduler.item_timeout));
                output::print_detail("default_agent", &scheduler.default_agent);

                output::print_header("Logging");
                output::print_detail("level", &governance.telemetry.logging.level);
                output::print_detail("format", format!("{:?}", governance.telemetry.logging.format));
            }
            _ => output::print_item(governance, format)?,
        },

        ConfigCommands::Modes => {
            let rows: Vec<ModeRow> = ContractMode::ALL
                .into_iter()
                .map(|mode| {
                    let defaults = governance.mode_defaults(mode);
                    ModeRow {
                        mode: mode.to_string(),
                        duration: format!("{}s", defaults.duration.as_secs()),
                        tokens: output::amount(defaults.token_budget),
                        iterations: output::amount(defaults.iteration_budget),
                        overridden: governance.modes.get(mode).is_some(),
                    }
                })
                .collect();
            output::print_list(&rows, format)?;
        }

        ConfigCommands::Validate => {
            governance.validate()?;
            output::print_success("Configuration is valid");
        }
    }

    Ok(())
}
