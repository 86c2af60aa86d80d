//! Contract status command.
//!
//! Builds a contract for a mode, activates it, applies the requested
//! consumption and reports the result.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use covenant_core::config::GovernanceConfig;
use covenant_core::contracts::{ContractMode, ResourceDimension};

use super::{build_root, parse_amount};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct StatusArgs {
    /// Contract mode
    #[arg(short, long, default_value = "balanced")]
    mode: ContractMode,

    /// Budget override, as DIMENSION=VALUE (repeatable)
    #[arg(short, long = "budget", value_parser = parse_amount)]
    budgets: Vec<(ResourceDimension, f64)>,

    /// Consumption to apply, as DIMENSION=VALUE (repeatable)
    #[arg(long = "consume", value_parser = parse_amount)]
    consume: Vec<(ResourceDimension, f64)>,
}

#[derive(Debug, Serialize, Tabled)]
struct DimensionRow {
    #[tabled(rename = "Dimension")]
    dimension: String,
    #[tabled(rename = "Budget")]
    budget: String,
    #[tabled(rename = "Consumed")]
    consumed: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
    #[tabled(rename = "Utilization")]
    utilization: String,
}

pub fn execute(args: StatusArgs, governance: &GovernanceConfig, format: OutputFormat) -> Result<()> {
    let contract = build_root(governance, args.mode, &args.budgets)?;
    contract.activate()?;

    let mut rejected = Vec::new();
    for (dimension, amount) in args.consume {
        if let Err(e) = contract.try_consume(dimension, amount) {
            rejected.push(format!("{} {}: {}", output::amount(amount), dimension, e));
        }
    }
    let check = contract.can_proceed();

    if format != OutputFormat::Table {
        return output::print_item(
            &serde_json::json!({
                "status": contract.status(),
                "can_proceed": check,
                "rejected": rejected,
            }),
            format,
        );
    }

    output::print_header(&format!("Contract {}", contract.id()));
    output::print_detail("Mode", contract.mode());
    output::print_detail("State", contract.state());
    output::print_detail(
        "Window",
        format!("{:.1}s remaining", contract.time_remaining().as_secs_f64()),
    );
    output::print_detail(
        "Can proceed",
        format!("{} ({})", check.allowed, check.reason),
    );
    println!();

    let rows: Vec<DimensionRow> = ResourceDimension::ALL
        .into_iter()
        .map(|dim| DimensionRow {
            dimension: dim.to_string(),
            budget: output::amount(contract.budget(dim)),
            consumed: output::amount(contract.consumed(dim)),
            remaining: output::amount(contract.ledger().remaining(dim)),
            utilization: output::percent(contract.utilization(dim)),
        })
        .collect();
    output::print_list(&rows, format)?;

    for warning in &check.warnings {
        output::print_warning(warning);
    }
    for rejection in &rejected {
        output::print_warning(&format!("Rejected {}", rejection));
    }
    Ok(())
}
