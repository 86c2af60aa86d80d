//! Governed batch simulation.
//!
//! Runs synthetic work items through a [`BatchScheduler`] under a root
//! contract, then prints per-item results, execution statistics and the
//! conservation audit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use tracing::info;

use covenant_core::config::GovernanceConfig;
use covenant_core::contracts::{ContractMode, ResourceDimension};
use covenant_core::scheduler::{
    BatchScheduler, ItemResult, WorkContext, WorkItem, WorkItemExecutor, WorkOutput,
};
use covenant_core::CovenantError;

use super::{build_root, parse_amount};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SimulateArgs {
    /// Root contract mode
    #[arg(short, long, default_value = "balanced")]
    mode: ContractMode,

    /// Root budget override, as DIMENSION=VALUE (repeatable)
    #[arg(short, long = "budget", value_parser = parse_amount)]
    budgets: Vec<(ResourceDimension, f64)>,

    /// Number of work items
    #[arg(short = 'n', long, default_value = "8")]
    items: usize,

    /// Override the configured worker count
    #[arg(short = 'w', long)]
    max_workers: Option<usize>,

    /// Consumption charged to the root before the run, as DIMENSION=VALUE
    #[arg(long = "preconsume", value_parser = parse_amount)]
    preconsume: Vec<(ResourceDimension, f64)>,

    /// Fail every K-th item
    #[arg(long)]
    fail_every: Option<usize>,

    /// Simulated latency per item in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Characters of output each item produces
    #[arg(long, default_value = "2000")]
    output_chars: usize,
}

#[derive(Deserialize)]
struct SimulatedPayload {
    index: usize,
}

/// Executor producing fixed-size output after a fixed delay.
struct SimulatedExecutor {
    latency: Duration,
    output_chars: usize,
    fail_every: Option<usize>,
    progress: ProgressBar,
}

#[async_trait]
impl WorkItemExecutor for SimulatedExecutor {
    async fn execute(&self, item: &WorkItem, ctx: &WorkContext) -> covenant_core::Result<WorkOutput> {
        tokio::time::sleep(self.latency).await;
        self.progress.inc(1);

        let SimulatedPayload { index } = item.payload_as()?;
        if self.fail_every.is_some_and(|k| k > 0 && (index + 1) % k == 0) {
            return Err(CovenantError::work_item_failed(
                item.id.clone(),
                "simulated failure",
            ));
        }

        let body = "x".repeat(self.output_chars);
        Ok(WorkOutput::new(format!("{}:{}", ctx.agent, body))
            .with_quality(0.8)
            .with_usage(ResourceDimension::ApiCalls, 1.0))
    }
}

#[derive(Debug, Serialize, Tabled)]
struct ResultRow {
    #[tabled(rename = "Item")]
    item: String,
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Success")]
    success: bool,
    #[tabled(rename = "Contract")]
    state: String,
    #[tabled(rename = "Tokens")]
    tokens: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&ItemResult> for ResultRow {
    fn from(result: &ItemResult) -> Self {
        Self {
            item: result.item_id.clone(),
            batch: result.batch,
            success: result.success,
            state: result
                .contract_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            tokens: output::amount(result.consumed(ResourceDimension::Tokens)),
            time: format!("{:.0}ms", result.execution_time.as_secs_f64() * 1000.0),
            error: result.error.clone().unwrap_or_default(),
        }
    }
}

pub async fn execute(
    args: SimulateArgs,
    governance: &GovernanceConfig,
    format: OutputFormat,
) -> Result<()> {
    let root = Arc::new(build_root(governance, args.mode, &args.budgets)?);
    root.activate()?;
    for (dimension, amount) in &args.preconsume {
        root.try_consume(*dimension, *amount)?;
    }

    let progress = if format == OutputFormat::Table {
        ProgressBar::new(args.items as u64)
    } else {
        ProgressBar::hidden()
    };
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} items")?
            .progress_chars("=>-"),
    );

    let mut config = governance.scheduler.clone();
    if let Some(max_workers) = args.max_workers {
        config = config.with_max_workers(max_workers);
    }
    let executor = SimulatedExecutor {
        latency: Duration::from_millis(args.latency_ms),
        output_chars: args.output_chars,
        fail_every: args.fail_every,
        progress: progress.clone(),
    };
    let scheduler = BatchScheduler::new(config, Arc::new(executor))?
        .with_root(Arc::clone(&root), governance.conservation.clone())?;

    let items: Vec<WorkItem> = (0..args.items)
        .map(|i| {
            WorkItem::new(format!("item-{}", i + 1), format!("simulated item {}", i + 1))
                .with_payload(serde_json::json!({ "index": i }))
        })
        .collect();

    let results = scheduler.execute_batch(items, None).await;
    progress.finish_and_clear();
    info!(
        root_id = %root.id(),
        items = results.len(),
        root_state = %root.state(),
        "Simulation finished"
    );

    let stats = scheduler.stats();
    let report = scheduler
        .enforcer()
        .map(|enforcer| enforcer.conservation_report());

    if format != OutputFormat::Table {
        return output::print_item(
            &serde_json::json!({
                "results": results,
                "stats": stats,
                "root": root.status(),
                "conservation": report,
            }),
            format,
        );
    }

    let rows: Vec<ResultRow> = results.iter().map(ResultRow::from).collect();
    output::print_list(&rows, format)?;

    output::print_header("Execution");
    output::print_detail("Items", stats.total);
    output::print_detail("Successful", stats.successful);
    output::print_detail("Failed", stats.failed);
    output::print_detail("Success rate", output::percent(stats.success_rate));
    output::print_detail("Batches", stats.batches);
    output::print_detail(
        "Average time",
        format!("{:.0}ms", stats.average_execution_time.as_secs_f64() * 1000.0),
    );

    output::print_header("Root contract");
    output::print_detail("State", root.state());
    output::print_detail(
        "Token utilization",
        output::percent(root.aggregate_utilization(ResourceDimension::Tokens)),
    );

    if let Some(report) = report {
        if report.holds {
            output::print_success(&format!(
                "Conservation holds across {} children",
                report.children
            ));
        } else {
            for audit in report.violations() {
                output::print_warning(&format!(
                    "Conservation violated on {}: {} of {}",
                    audit.dimension,
                    output::amount(audit.total),
                    output::amount(audit.budget)
                ));
            }
        }
    }
    Ok(())
}
