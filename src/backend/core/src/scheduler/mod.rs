//! Contract-aware batch scheduling.
//!
//! The [`BatchScheduler`] runs work items in sequential batches. Under a root
//! contract each item gets its own child contract from a
//! [`ConservationEnforcer`], and the batch size shrinks as the root fills up:
//!
//! | root max utilization | batch size                       |
//! |----------------------|----------------------------------|
//! | > high (0.8)         | 1                                |
//! | > medium (0.5)       | 2, capped by `max_workers`       |
//! | otherwise            | `min(max_workers, max_batch_size)` |
//!
//! Without a root contract every item goes into one batch, bounded only by
//! the worker pool.

mod selector;
mod work;
mod worker_pool;

pub use selector::{
    AgentRankings, AgentSelectionStats, AgentSelector, FixedAgent, ResourceAwareSelector,
    Selection, SelectionReason,
};
pub use work::{
    CostModel, ExecutionStats, ItemResult, OutputSizeCostModel, WorkContext, WorkItem,
    WorkItemExecutor, WorkOutput,
};
pub use worker_pool::{WorkerPermit, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::{
    ConservationEnforcer, Contract, ContractState, EnforcementConfig, ResourceAmounts,
};
use crate::error::{CovenantError, ErrorCode, Result};
use crate::telemetry::metrics::{ContractMetrics, SchedulerMetrics};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Above this root utilization batches run one item at a time
    #[serde(default = "default_high_utilization")]
    pub high_utilization_threshold: f64,

    /// Above this root utilization batches hold at most two items
    #[serde(default = "default_medium_utilization")]
    pub medium_utilization_threshold: f64,

    /// Batch size when the root has headroom
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Per-item execution limit
    #[serde(default = "default_item_timeout", with = "humantime_serde")]
    pub item_timeout: Duration,

    /// How long an item waits for a worker slot
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Agent used when no selector is supplied
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

fn default_max_workers() -> usize {
    4
}

fn default_high_utilization() -> f64 {
    0.8
}

fn default_medium_utilization() -> f64 {
    0.5
}

fn default_max_batch_size() -> usize {
    3
}

fn default_item_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_agent() -> String {
    "default".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            high_utilization_threshold: default_high_utilization(),
            medium_utilization_threshold: default_medium_utilization(),
            max_batch_size: default_max_batch_size(),
            item_timeout: default_item_timeout(),
            acquire_timeout: default_acquire_timeout(),
            default_agent: default_agent(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                "scheduler.max_workers must be at least 1",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                "scheduler.max_batch_size must be at least 1",
            ));
        }
        for (name, value) in [
            ("high_utilization_threshold", self.high_utilization_threshold),
            ("medium_utilization_threshold", self.medium_utilization_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CovenantError::invalid_threshold(name, value));
            }
        }
        if self.medium_utilization_threshold > self.high_utilization_threshold {
            return Err(CovenantError::invalid_threshold(
                "medium_utilization_threshold",
                self.medium_utilization_threshold,
            )
            .with_context("high_utilization_threshold", self.high_utilization_threshold));
        }
        if self.item_timeout.is_zero() || self.acquire_timeout.is_zero() {
            return Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                "scheduler timeouts must be non-zero",
            ));
        }
        Ok(())
    }

    fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.max_workers).with_acquire_timeout(self.acquire_timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs work items in utilization-sized batches.
pub struct BatchScheduler {
    config: SchedulerConfig,
    enforcer: Option<Arc<ConservationEnforcer>>,
    executor: Arc<dyn WorkItemExecutor>,
    cost_model: Arc<dyn CostModel>,
    pool: Arc<WorkerPool>,
    cancellation: CancellationToken,
    active: Arc<DashMap<Uuid, Arc<Contract>>>,
    history: RwLock<Vec<ItemResult>>,
    batches_run: AtomicUsize,
}

impl BatchScheduler {
    /// Scheduler without a root contract.
    pub fn new(config: SchedulerConfig, executor: Arc<dyn WorkItemExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: Arc::new(WorkerPool::new(config.pool_config())),
            config,
            enforcer: None,
            executor,
            cost_model: Arc::new(OutputSizeCostModel::default()),
            cancellation: CancellationToken::new(),
            active: Arc::new(DashMap::new()),
            history: RwLock::new(Vec::new()),
            batches_run: AtomicUsize::new(0),
        })
    }

    /// Govern every batch by `root`, allocating children with `enforcement`.
    pub fn with_root(mut self, root: Arc<Contract>, enforcement: EnforcementConfig) -> Result<Self> {
        self.enforcer = Some(Arc::new(ConservationEnforcer::with_config(enforcement, root)?));
        Ok(self)
    }

    /// Govern by an existing enforcer, sharing its child registry.
    pub fn with_enforcer(mut self, enforcer: Arc<ConservationEnforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn root(&self) -> Option<&Arc<Contract>> {
        self.enforcer.as_ref().map(|e| e.root())
    }

    pub fn enforcer(&self) -> Option<&Arc<ConservationEnforcer>> {
        self.enforcer.as_ref()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Batch size for a given root utilization.
    pub fn plan_batch_size(&self, utilization: f64) -> usize {
        let max_workers = self.config.max_workers;
        if utilization > self.config.high_utilization_threshold {
            1
        } else if utilization > self.config.medium_utilization_threshold {
            2.min(max_workers)
        } else {
            max_workers.min(self.config.max_batch_size)
        }
    }

    /// Batch size the next batch would get.
    pub fn next_batch_size(&self) -> usize {
        match self.root() {
            Some(root) => self.plan_batch_size(root.aggregate_max_utilization()),
            None => self.config.max_workers,
        }
    }

    /// Cancel running and future work.
    ///
    /// Running items observe the token and finish as cancelled; their child
    /// contracts are terminated. A cancelled scheduler stays cancelled.
    pub fn cancel(&self) {
        info!(active_items = self.active.len(), "Scheduler cancelled");
        self.cancellation.cancel();
        for entry in self.active.iter() {
            let _ = entry.value().terminate("Scheduler cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Items currently executing under a child contract.
    pub fn active_items(&self) -> usize {
        self.active.len()
    }

    /// Every result produced so far, in completion order of batches.
    pub fn history(&self) -> Vec<ItemResult> {
        self.history.read().clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats::from_results(&self.history.read(), self.batches_run.load(Ordering::Relaxed))
    }

    /// Run `items`, returning one result per item in input order.
    pub async fn execute_batch(
        &self,
        items: Vec<WorkItem>,
        selector: Option<&dyn AgentSelector>,
    ) -> Vec<ItemResult> {
        let fallback = FixedAgent::new(self.config.default_agent.clone());
        let selector: &dyn AgentSelector = match selector {
            Some(selector) => selector,
            None => &fallback,
        };

        let total = items.len();
        let mut results: Vec<Option<ItemResult>> = vec![None; total];
        let mut queue: VecDeque<(usize, WorkItem)> = items.into_iter().enumerate().collect();

        info!(
            items = total,
            governed = self.enforcer.is_some(),
            "Executing work items"
        );

        match &self.enforcer {
            Some(enforcer) => {
                self.run_governed(enforcer, &mut queue, &mut results, selector)
                    .await
            }
            None => {
                let batch = queue
                    .drain(..)
                    .map(|(index, item)| {
                        let agent = selector.select(&item, None);
                        Assignment { index, item, agent, contract: None }
                    })
                    .collect();
                self.dispatch(batch, &mut results).await;
            }
        }

        let results: Vec<ItemResult> = results.into_iter().flatten().collect();
        self.history.write().extend(results.iter().cloned());
        results
    }

    async fn run_governed(
        &self,
        enforcer: &Arc<ConservationEnforcer>,
        queue: &mut VecDeque<(usize, WorkItem)>,
        results: &mut [Option<ItemResult>],
        selector: &dyn AgentSelector,
    ) {
        let root = enforcer.root();

        while !queue.is_empty() {
            if self.cancellation.is_cancelled() {
                fail_remaining(queue, results, ErrorCode::WorkItemCancelled, "Scheduler cancelled");
                return;
            }

            let check = root.can_proceed();
            if !check.allowed {
                warn!(
                    root_id = %root.id(),
                    reason = %check.reason,
                    remaining_items = queue.len(),
                    "Root contract refused further work"
                );
                let reason = format!("Contract constraint: {}", check.reason);
                fail_remaining(queue, results, constraint_code(root.state()), &reason);
                return;
            }

            let target = self.next_batch_size().min(queue.len());
            let children = allocate_children(enforcer, target);
            if children.is_empty() {
                warn!(
                    root_id = %root.id(),
                    remaining_items = queue.len(),
                    "No child contract could be activated"
                );
                fail_remaining(
                    queue,
                    results,
                    ErrorCode::ConservationViolation,
                    "Contract constraint: no child contract could be allocated",
                );
                return;
            }

            let batch: Vec<Assignment> = children
                .into_iter()
                .filter_map(|child| {
                    let (index, item) = queue.pop_front()?;
                    let agent = selector.select(&item, Some(root));
                    Some(Assignment { index, item, agent, contract: Some(child) })
                })
                .collect();

            self.dispatch(batch, results).await;
            ContractMetrics::set_root_utilization(root.aggregate_max_utilization());
        }
    }

    async fn dispatch(&self, batch: Vec<Assignment>, results: &mut [Option<ItemResult>]) {
        if batch.is_empty() {
            return;
        }
        let batch_index = self.batches_run.fetch_add(1, Ordering::Relaxed);
        SchedulerMetrics::record_batch(batch.len());
        debug!(batch = batch_index, size = batch.len(), "Dispatching batch");

        let mut pending = Vec::with_capacity(batch.len());
        let mut handles = Vec::with_capacity(batch.len());
        for assignment in batch {
            let worker = Worker {
                item: assignment.item.clone(),
                agent: assignment.agent.clone(),
                contract: assignment.contract.clone(),
                executor: Arc::clone(&self.executor),
                cost_model: Arc::clone(&self.cost_model),
                pool: Arc::clone(&self.pool),
                cancellation: self.cancellation.clone(),
                timeout: self.config.item_timeout,
                active: Arc::clone(&self.active),
            };
            handles.push(tokio::spawn(worker.run()));
            pending.push(assignment);
        }

        let outcomes = futures::future::join_all(handles).await;
        for (assignment, outcome) in pending.into_iter().zip(outcomes) {
            let mut result = outcome.unwrap_or_else(|e| {
                let reason = if e.is_panic() {
                    "Worker panicked"
                } else {
                    "Worker aborted"
                };
                warn!(item_id = %assignment.item.id, "{}", reason);
                abandon(&assignment, reason)
            });
            result.batch = batch_index;
            SchedulerMetrics::record_item(result.success, result.execution_time.as_secs_f64());
            results[assignment.index] = Some(result);
        }
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .field("root_id", &self.root().map(|r| r.id()))
            .field("batches_run", &self.batches_run.load(Ordering::Relaxed))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Assignment {
    index: usize,
    item: WorkItem,
    agent: String,
    contract: Option<Arc<Contract>>,
}

/// Create and activate `size` children, shrinking by one on each failure.
fn allocate_children(enforcer: &ConservationEnforcer, size: usize) -> Vec<Arc<Contract>> {
    let mode = enforcer.root().mode();

    for attempt in (1..=size).rev() {
        let mut created = Vec::with_capacity(attempt);
        let mut failure = None;

        for _ in 0..attempt {
            match enforcer.create_child_contract(mode) {
                Ok(child) => created.push(child),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            failure = created
                .iter()
                .find_map(|child| enforcer.activate_child(child).err());
        }

        match failure {
            None => return created,
            Some(e) => {
                debug!(batch_size = attempt, error = %e, "Child allocation failed, shrinking batch");
                for child in &created {
                    if !enforcer.release_child(child) {
                        let _ = child.terminate("Batch allocation rolled back");
                    }
                }
            }
        }
    }
    Vec::new()
}

fn constraint_code(state: ContractState) -> ErrorCode {
    match state {
        ContractState::Expired => ErrorCode::ContractExpired,
        ContractState::Violated => ErrorCode::ResourceExhausted,
        _ => ErrorCode::ContractTerminated,
    }
}

fn fail_remaining(
    queue: &mut VecDeque<(usize, WorkItem)>,
    results: &mut [Option<ItemResult>],
    code: ErrorCode,
    reason: &str,
) {
    for (index, item) in queue.drain(..) {
        results[index] = Some(ItemResult::failed(&item, "", code, reason));
    }
}

fn abandon(assignment: &Assignment, reason: &str) -> ItemResult {
    let result = ItemResult::failed(
        &assignment.item,
        assignment.agent.clone(),
        ErrorCode::InternalError,
        reason,
    );
    match &assignment.contract {
        Some(child) => {
            if child.is_active() {
                let _ = child.terminate(reason);
            }
            result.with_contract(child)
        }
        None => result,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

struct Worker {
    item: WorkItem,
    agent: String,
    contract: Option<Arc<Contract>>,
    executor: Arc<dyn WorkItemExecutor>,
    cost_model: Arc<dyn CostModel>,
    pool: Arc<WorkerPool>,
    cancellation: CancellationToken,
    timeout: Duration,
    active: Arc<DashMap<Uuid, Arc<Contract>>>,
}

/// Registration in the scheduler's active map, removed on drop so a
/// panicking executor cannot leave its child behind.
struct ActiveEntry {
    active: Arc<DashMap<Uuid, Arc<Contract>>>,
    id: Uuid,
}

impl ActiveEntry {
    fn insert(active: &Arc<DashMap<Uuid, Arc<Contract>>>, child: &Arc<Contract>) -> Self {
        active.insert(child.id(), Arc::clone(child));
        Self {
            active: Arc::clone(active),
            id: child.id(),
        }
    }
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

impl Worker {
    async fn run(self) -> ItemResult {
        // Governed batches never exceed the pool; ungoverned items queue for a slot.
        let acquired = match &self.contract {
            Some(_) => self.pool.acquire().await,
            None => tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    Err(CovenantError::work_item_cancelled(self.item.id.clone()))
                }
                permit = self.pool.acquire_queued() => permit,
            },
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => return self.fail(e, Duration::ZERO),
        };

        if let Some(child) = &self.contract {
            let check = child.can_proceed();
            if !check.allowed {
                permit.mark_failure();
                let reason = format!("Contract constraint: {}", check.reason);
                return ItemResult::failed(&self.item, self.agent.clone(), constraint_code(child.state()), reason)
                    .with_contract(child);
            }
        }
        let _active = self.contract.as_ref().map(|child| ActiveEntry::insert(&self.active, child));

        let start = Instant::now();
        let ctx = WorkContext {
            agent: self.agent.clone(),
            contract: self.contract.clone(),
            cancellation: self.cancellation.clone(),
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                Err(CovenantError::work_item_cancelled(self.item.id.clone()))
            }
            executed = tokio::time::timeout(self.timeout, self.executor.execute(&self.item, &ctx)) => {
                match executed {
                    Ok(result) => result,
                    Err(_) => Err(CovenantError::work_item_timeout(self.item.id.clone(), self.timeout)),
                }
            }
        };
        let elapsed = start.elapsed();

        let result = match outcome {
            Ok(output) => self.settle(output, elapsed),
            Err(e) => self.fail(e, elapsed),
        };

        if result.success {
            permit.mark_success();
        } else {
            permit.mark_failure();
        }
        result
    }

    /// Charge the cost of a finished item and score it.
    fn settle(&self, output: WorkOutput, elapsed: Duration) -> ItemResult {
        let mut estimate = self.cost_model.estimate(&self.item, &output, elapsed);
        estimate.extend(output.usage.iter().map(|(dim, amount)| (*dim, *amount)));

        let mut charged = ResourceAmounts::new();
        let mut evaluation = Ok(None);
        for (dimension, amount) in estimate {
            if amount <= 0.0 {
                continue;
            }
            if let Some(child) = &self.contract {
                if let Err(e) = child.try_consume(dimension, amount) {
                    evaluation = Err(e);
                    break;
                }
            }
            charged.insert(dimension, amount);
        }

        if evaluation.is_ok() {
            if let Some(child) = &self.contract {
                evaluation = child
                    .evaluate_success(&output.output, output.quality_score)
                    .map(|e| {
                        if !e.fulfilled {
                            self.terminate_child("Success criteria not met");
                        }
                        Some(e.score)
                    });
            }
        }

        let mut result = match evaluation {
            Ok(score) => {
                let mut result = ItemResult::new(&self.item, self.agent.clone());
                result.success = true;
                result.score = score;
                result
            }
            Err(e) => {
                self.terminate_child(e.message());
                ItemResult::failed(&self.item, self.agent.clone(), e.code(), e.to_string())
            }
        };

        result.output = Some(output.output);
        result.quality_score = Some(output.quality_score);
        result.resources_consumed = charged;
        result.execution_time = elapsed;
        match &self.contract {
            Some(child) => result.with_contract(child),
            None => result,
        }
    }

    fn fail(&self, error: CovenantError, elapsed: Duration) -> ItemResult {
        debug!(item_id = %self.item.id, agent = %self.agent, error = %error, "Work item failed");
        self.terminate_child(error.message());

        let mut result = ItemResult::failed(&self.item, self.agent.clone(), error.code(), error.to_string());
        result.execution_time = elapsed;
        match &self.contract {
            Some(child) => result.with_contract(child),
            None => result,
        }
    }

    fn terminate_child(&self, reason: &str) {
        if let Some(child) = &self.contract {
            if child.is_active() {
                let _ = child.terminate(reason);
            }
        }
    }
}
