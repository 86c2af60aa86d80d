//! Child allocation command.
//!
//! Shows the budgets successive children receive from a root under the
//! configured reserve buffer.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use covenant_core::config::GovernanceConfig;
use covenant_core::contracts::{ConservationEnforcer, ContractMode, ResourceDimension};

use super::{build_root, parse_amount};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct AllocateArgs {
    /// Root contract mode
    #[arg(short, long, default_value = "balanced")]
    mode: ContractMode,

    /// Root budget override, as DIMENSION=VALUE (repeatable)
    #[arg(short, long = "budget", value_parser = parse_amount)]
    budgets: Vec<(ResourceDimension, f64)>,

    /// Number of children to allocate
    #[arg(short = 'n', long, default_value = "4")]
    children: usize,

    /// Mode for the children
    #[arg(long, default_value = "balanced")]
    child_mode: ContractMode,

    /// Override the configured reserve buffer
    #[arg(short, long)]
    reserve: Option<f64>,
}

#[derive(Debug, Serialize, Tabled)]
struct ChildRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Contract")]
    id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Budgets")]
    budgets: String,
}

pub fn execute(args: AllocateArgs, governance: &GovernanceConfig, format: OutputFormat) -> Result<()> {
    let root = Arc::new(build_root(governance, args.mode, &args.budgets)?);
    root.activate()?;

    let mut config = governance.conservation.clone();
    if let Some(reserve) = args.reserve {
        config = config.with_reserve_buffer(reserve);
    }
    let enforcer = ConservationEnforcer::with_config(config, Arc::clone(&root))?;

    let mut rows = Vec::with_capacity(args.children);
    for index in 1..=args.children {
        let child = enforcer.create_child_contract(args.child_mode)?;
        if let Err(e) = enforcer.activate_child(&child) {
            output::print_warning(&format!("Child {} not activated: {}", index, e));
        }
        rows.push(ChildRow {
            index,
            id: child.id().to_string(),
            state: child.state().to_string(),
            budgets: child
                .budgets()
                .iter()
                .map(|(dim, value)| format!("{}={}", dim, output::amount(value)))
                .collect::<Vec<_>>()
                .join(", "),
        });
    }

    output::print_list(&rows, format)?;
    if format == OutputFormat::Table {
        let stats = enforcer.stats();
        output::print_detail("Root", root.id());
        output::print_detail("Reserve buffer", output::percent(enforcer.config().reserve_buffer));
        output::print_detail("Children active", stats.children_active);
        output::print_detail("Conservation holds", enforcer.verify_conservation());
    }
    Ok(())
}
