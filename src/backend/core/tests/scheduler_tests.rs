//! Integration tests for the batch scheduler.
//!
//! Tests cover:
//! - Utilization tiers and batch planning
//! - Governed runs with one child contract per item
//! - Root exhaustion mid-run
//! - Executor failures, panics, timeouts and cancellation
//! - Queued ungoverned items
//! - Agent selection and cost models

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use covenant_core::contracts::{
    Contract, ContractBuilder, ContractMode, ContractState, EnforcementConfig, ResourceAmounts,
    ResourceDimension,
};
use covenant_core::error::{CovenantError, ErrorCode, Result};
use covenant_core::scheduler::{
    AgentRankings, BatchScheduler, CostModel, ResourceAwareSelector, SchedulerConfig, WorkContext,
    WorkItem, WorkItemExecutor, WorkOutput,
};
use ResourceDimension::*;

// ============================================================================
// Fixtures
// ============================================================================

struct Scripted {
    latency: Duration,
    output_len: usize,
    quality: f64,
    fail: HashSet<String>,
    panic: HashSet<String>,
}

impl Scripted {
    fn new(output_len: usize) -> Self {
        Self {
            latency: Duration::from_millis(5),
            output_len,
            quality: 0.9,
            fail: HashSet::new(),
            panic: HashSet::new(),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    fn failing(mut self, id: &str) -> Self {
        self.fail.insert(id.to_string());
        self
    }

    fn panicking(mut self, id: &str) -> Self {
        self.panic.insert(id.to_string());
        self
    }
}

#[async_trait]
impl WorkItemExecutor for Scripted {
    async fn execute(&self, item: &WorkItem, ctx: &WorkContext) -> Result<WorkOutput> {
        tokio::time::sleep(self.latency).await;
        if self.fail.contains(&item.id) {
            return Err(CovenantError::work_item_failed(item.id.clone(), "scripted failure"));
        }
        if self.panic.contains(&item.id) {
            panic!("executor crashed on {}", item.id);
        }
        Ok(WorkOutput::new(format!("{}:{}", ctx.agent, "x".repeat(self.output_len)))
            .with_quality(self.quality))
    }
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(format!("item-{}", i), format!("task {}", i)))
        .collect()
}

fn root(tokens: f64) -> Arc<Contract> {
    let root = Arc::new(
        ContractBuilder::new(ContractMode::Balanced)
            .budget(Tokens, tokens)
            .budget(Iterations, 1_000.0)
            .build()
            .unwrap(),
    );
    root.activate().unwrap();
    root
}

fn governed(
    max_workers: usize,
    root: &Arc<Contract>,
    reserve_buffer: f64,
    executor: Scripted,
) -> BatchScheduler {
    BatchScheduler::new(
        SchedulerConfig::default().with_max_workers(max_workers),
        Arc::new(executor),
    )
    .unwrap()
    .with_root(
        Arc::clone(root),
        EnforcementConfig::default().with_reserve_buffer(reserve_buffer),
    )
    .unwrap()
}

// ============================================================================
// Batch Planning
// ============================================================================

#[test]
fn test_batch_size_tiers() {
    let scheduler = BatchScheduler::new(
        SchedulerConfig::default().with_max_workers(3),
        Arc::new(Scripted::new(0)),
    )
    .unwrap();

    assert_eq!(scheduler.plan_batch_size(0.85), 1);
    assert_eq!(scheduler.plan_batch_size(0.6), 2);
    assert_eq!(scheduler.plan_batch_size(0.2), 3);
}

#[test]
fn test_batch_size_follows_root_consumption() {
    let busy = Arc::new(Contract::new(ContractMode::Balanced).unwrap());
    busy.activate().unwrap();
    assert!(busy.consume(Tokens, 85_000.0));
    let scheduler = governed(4, &busy, 0.15, Scripted::new(0));
    assert_eq!(scheduler.next_batch_size(), 1);

    let idle = Arc::new(Contract::new(ContractMode::Balanced).unwrap());
    idle.activate().unwrap();
    assert!(idle.consume(Tokens, 30_000.0));
    let scheduler = governed(4, &idle, 0.15, Scripted::new(0));
    assert_eq!(scheduler.next_batch_size(), 3);
}

// ============================================================================
// Governed Execution
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_governed_run_conserves_root() {
    let root = root(100_000.0);
    let scheduler = governed(3, &root, 0.15, Scripted::new(400));

    let results = scheduler.execute_batch(items(7), None).await;

    assert_eq!(results.len(), 7);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.item_id, format!("item-{}", i));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contract_state, Some(ContractState::Fulfilled));
        assert_eq!(result.consumed(Iterations), 1.0);
        assert!(result.consumed(Tokens) >= 100.0);
        assert_eq!(result.quality_score, Some(0.9));
    }

    let enforcer = scheduler.enforcer().unwrap();
    assert_eq!(enforcer.child_count(), 7);
    assert!(enforcer.verify_conservation());
    assert_eq!(root.delegated(Iterations), 7.0);

    let stats = scheduler.stats();
    assert_eq!(stats.total, 7);
    assert_eq!(stats.successful, 7);
    assert_eq!(stats.success_rate, 1.0);
    assert!(stats.batches >= 3);
}

#[tokio::test]
async fn test_root_exhaustion_stops_remaining_items() {
    let root = root(100.0);
    let scheduler = governed(1, &root, 0.0, Scripted::new(392));

    let results = scheduler.execute_batch(items(3), None).await;

    assert!(results[0].success);
    assert_eq!(results[0].consumed(Tokens), 100.0);
    for result in &results[1..] {
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::ResourceExhausted));
        assert!(result.error.as_deref().unwrap().starts_with("Contract constraint"));
    }
    assert_eq!(root.state(), ContractState::Violated);
    assert!(scheduler.enforcer().unwrap().verify_conservation());
}

#[tokio::test]
async fn test_overspending_item_fails_and_violates_child() {
    let root = root(100.0);
    let scheduler = governed(1, &root, 0.0, Scripted::new(800));

    let results = scheduler.execute_batch(items(1), None).await;

    assert!(!results[0].success);
    assert_eq!(results[0].error_code, Some(ErrorCode::ResourceExhausted));
    assert_eq!(results[0].contract_state, Some(ContractState::Violated));
    assert!(results[0].output.is_some());
    assert_eq!(root.delegated(Tokens), 0.0);
}

#[tokio::test]
async fn test_executor_failure_terminates_child() {
    let root = root(100_000.0);
    let scheduler = governed(2, &root, 0.15, Scripted::new(10).failing("item-1"));

    let results = scheduler.execute_batch(items(3), None).await;

    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[2].success);
    assert_eq!(results[1].error_code, Some(ErrorCode::WorkItemFailed));
    assert_eq!(results[1].contract_state, Some(ContractState::Terminated));
    assert!(results[1].resources_consumed.is_empty());

    let stats = scheduler.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(scheduler.history().len(), 3);
}

#[tokio::test]
async fn test_item_timeout() {
    let root = root(100_000.0);
    let scheduler = BatchScheduler::new(
        SchedulerConfig::default().with_item_timeout(Duration::from_millis(20)),
        Arc::new(Scripted::new(10).with_latency(Duration::from_millis(500))),
    )
    .unwrap()
    .with_root(Arc::clone(&root), EnforcementConfig::default())
    .unwrap();

    let results = scheduler.execute_batch(items(1), None).await;

    assert!(!results[0].success);
    assert_eq!(results[0].error_code, Some(ErrorCode::WorkItemTimeout));
    assert_eq!(results[0].contract_state, Some(ContractState::Terminated));
    assert!(results[0].execution_time < Duration::from_millis(500));
}

#[tokio::test]
async fn test_executor_panic_terminates_child_and_clears_active() {
    let root = root(100_000.0);
    let scheduler = governed(2, &root, 0.15, Scripted::new(10).panicking("item-0"));

    let results = scheduler.execute_batch(items(2), None).await;

    assert!(!results[0].success);
    assert_eq!(results[0].error_code, Some(ErrorCode::InternalError));
    assert_eq!(results[0].contract_state, Some(ContractState::Terminated));
    assert!(results[1].success);
    assert_eq!(scheduler.active_items(), 0);
    assert!(scheduler.enforcer().unwrap().verify_conservation());
}

#[tokio::test]
async fn test_unfulfilled_child_is_closed_after_settlement() {
    let root = root(100_000.0);
    let scheduler = governed(2, &root, 0.15, Scripted::new(10).with_quality(0.5));

    let results = scheduler.execute_batch(items(2), None).await;

    for result in &results {
        assert!(result.success);
        assert_eq!(result.contract_state, Some(ContractState::Terminated));
        assert_eq!(result.quality_score, Some(0.5));
    }
    assert_eq!(scheduler.enforcer().unwrap().stats().children_active, 0);
}

#[tokio::test]
async fn test_inactive_root_fails_everything() {
    let root = Arc::new(Contract::new(ContractMode::Urgent).unwrap());
    let scheduler = governed(3, &root, 0.15, Scripted::new(10));

    let results = scheduler.execute_batch(items(2), None).await;
    assert!(results.iter().all(|r| !r.success));
    assert_eq!(scheduler.enforcer().unwrap().child_count(), 0);
}

// ============================================================================
// Ungoverned Execution
// ============================================================================

#[tokio::test]
async fn test_ungoverned_runs_single_batch() {
    let scheduler = BatchScheduler::new(
        SchedulerConfig::default().with_max_workers(2),
        Arc::new(Scripted::new(40)),
    )
    .unwrap();

    let results = scheduler.execute_batch(items(5), None).await;

    assert!(results.iter().all(|r| r.success));
    assert!(results.iter().all(|r| r.batch == 0 && r.contract_id.is_none()));
    assert_eq!(scheduler.pool().stats().peak_concurrent, 2);
    assert_eq!(scheduler.stats().agent_usage["default"], 5);
}

#[tokio::test]
async fn test_ungoverned_items_wait_past_acquire_timeout() {
    let config = SchedulerConfig {
        acquire_timeout: Duration::from_millis(150),
        ..SchedulerConfig::default().with_max_workers(1)
    };
    let scheduler = BatchScheduler::new(
        config,
        Arc::new(Scripted::new(10).with_latency(Duration::from_millis(100))),
    )
    .unwrap();

    let results = scheduler.execute_batch(items(4), None).await;

    for result in &results {
        assert!(result.success, "{}: {:?}", result.item_id, result.error_code);
    }
    let stats = scheduler.pool().stats();
    assert_eq!(stats.acquire_timeouts, 0);
    assert_eq!(stats.peak_concurrent, 1);
}

#[tokio::test]
async fn test_cancel_stops_running_items() {
    let scheduler = Arc::new(
        BatchScheduler::new(
            SchedulerConfig::default(),
            Arc::new(Scripted::new(10).with_latency(Duration::from_secs(10))),
        )
        .unwrap(),
    );

    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute_batch(items(3), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.cancel();

    let results = running.await.unwrap();
    assert!(scheduler.is_cancelled());
    assert!(results
        .iter()
        .all(|r| r.error_code == Some(ErrorCode::WorkItemCancelled)));
}

// ============================================================================
// Selection And Cost
// ============================================================================

#[tokio::test]
async fn test_resource_aware_selection() {
    let root = root(100_000.0);
    let scheduler = governed(3, &root, 0.15, Scripted::new(10));
    let selector = ResourceAwareSelector::new(
        vec!["lean".to_string(), "careful".to_string()],
        AgentRankings {
            quality: vec!["careful".to_string()],
            efficiency: vec!["lean".to_string()],
            ..Default::default()
        },
    );

    let results = scheduler.execute_batch(items(2), Some(&selector)).await;

    assert!(results.iter().all(|r| r.agent == "careful"));
    assert!(results[0].output.as_deref().unwrap().starts_with("careful:"));
    assert_eq!(selector.selection_stats()["careful"].count, 2);
}

struct PerCall;

impl CostModel for PerCall {
    fn estimate(&self, _item: &WorkItem, _output: &WorkOutput, _elapsed: Duration) -> ResourceAmounts {
        ResourceAmounts::from([(ApiCalls, 2.0)])
    }
}

#[tokio::test]
async fn test_custom_cost_model() {
    let root = root(100_000.0);
    let scheduler = governed(2, &root, 0.15, Scripted::new(10)).with_cost_model(Arc::new(PerCall));

    let results = scheduler.execute_batch(items(2), None).await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(results[0].consumed(ApiCalls), 2.0);
    assert_eq!(results[0].consumed(Tokens), 0.0);
    assert_eq!(root.delegated(ApiCalls), 4.0);
}
