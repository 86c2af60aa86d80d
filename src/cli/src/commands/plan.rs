//! Batch planning command.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use covenant_core::config::GovernanceConfig;
use covenant_core::scheduler::{BatchScheduler, WorkContext, WorkItem, WorkItemExecutor, WorkOutput};

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct PlanArgs {
    /// Root utilization, between 0 and 1
    #[arg(short, long)]
    utilization: Vec<f64>,

    /// Override the configured worker count
    #[arg(short = 'w', long)]
    max_workers: Option<usize>,
}

#[derive(Debug, Serialize, Tabled)]
struct PlanRow {
    #[tabled(rename = "Utilization")]
    utilization: String,
    #[tabled(rename = "Tier")]
    tier: &'static str,
    #[tabled(rename = "Batch Size")]
    batch_size: usize,
}

/// Planning never executes work.
struct NoWork;

#[async_trait]
impl WorkItemExecutor for NoWork {
    async fn execute(&self, _item: &WorkItem, _ctx: &WorkContext) -> covenant_core::Result<WorkOutput> {
        Ok(WorkOutput::new(""))
    }
}

pub fn execute(args: PlanArgs, governance: &GovernanceConfig, format: OutputFormat) -> Result<()> {
    let mut config = governance.scheduler.clone();
    if let Some(max_workers) = args.max_workers {
        config = config.with_max_workers(max_workers);
    }

    let levels = if args.utilization.is_empty() {
        vec![0.0, 0.3, 0.5, 0.6, 0.8, 0.85, 1.0]
    } else {
        args.utilization
    };
    if let Some(bad) = levels.iter().find(|u| !(0.0..=1.0).contains(*u)) {
        bail!("utilization must be between 0 and 1, got {}", bad);
    }

    let scheduler = BatchScheduler::new(config.clone(), Arc::new(NoWork))?;
    let rows: Vec<PlanRow> = levels
        .into_iter()
        .map(|utilization| PlanRow {
            utilization: output::percent(utilization),
            tier: if utilization > config.high_utilization_threshold {
                "high"
            } else if utilization > config.medium_utilization_threshold {
                "medium"
            } else {
                "low"
            },
            batch_size: scheduler.plan_batch_size(utilization),
        })
        .collect();

    output::print_list(&rows, format)
}
