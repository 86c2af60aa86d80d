//! Work items, executor and cost-model seams, and per-item results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::contracts::{Contract, ContractState, ResourceAmounts, ResourceDimension};
use crate::error::{ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Work Items
// ═══════════════════════════════════════════════════════════════════════════════

/// An opaque unit of work. The scheduler never looks inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Decode the payload into an executor-specific type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// What an executor hands back for a finished item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOutput {
    pub output: String,
    #[serde(default = "default_quality")]
    pub quality_score: f64,
    /// Consumption measured by the executor itself. Overrides the cost
    /// model's estimate for the dimensions it names.
    #[serde(default)]
    pub usage: ResourceAmounts,
}

fn default_quality() -> f64 {
    1.0
}

impl WorkOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            quality_score: default_quality(),
            usage: ResourceAmounts::new(),
        }
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn with_usage(mut self, dimension: ResourceDimension, amount: f64) -> Self {
        self.usage.insert(dimension, amount);
        self
    }
}

/// Everything an executor may use while running one item.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub agent: String,
    /// The item's child contract, when the batch runs under a root.
    pub contract: Option<Arc<Contract>>,
    pub cancellation: CancellationToken,
}

impl WorkContext {
    pub fn contract_id(&self) -> Option<Uuid> {
        self.contract.as_ref().map(|c| c.id())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Seams
// ═══════════════════════════════════════════════════════════════════════════════

/// Performs a work item on behalf of a named agent.
#[async_trait]
pub trait WorkItemExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem, ctx: &WorkContext) -> Result<WorkOutput>;
}

/// Estimates what a finished item consumed.
pub trait CostModel: Send + Sync {
    fn estimate(&self, item: &WorkItem, output: &WorkOutput, elapsed: Duration) -> ResourceAmounts;
}

/// Tokens from output length, one iteration per item, wall time as compute.
#[derive(Debug, Clone)]
pub struct OutputSizeCostModel {
    pub chars_per_token: usize,
}

impl Default for OutputSizeCostModel {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl CostModel for OutputSizeCostModel {
    fn estimate(&self, _item: &WorkItem, output: &WorkOutput, elapsed: Duration) -> ResourceAmounts {
        let chars = output.output.chars().count();
        let tokens = chars / self.chars_per_token.max(1);

        let mut amounts = ResourceAmounts::new();
        amounts.insert(ResourceDimension::Tokens, tokens as f64);
        amounts.insert(ResourceDimension::Iterations, 1.0);
        amounts.insert(ResourceDimension::ComputeTime, elapsed.as_secs_f64());
        amounts
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub description: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub agent: String,
    pub resources_consumed: ResourceAmounts,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    pub contract_id: Option<Uuid>,
    pub contract_state: Option<ContractState>,
    pub quality_score: Option<f64>,
    /// Weighted success-criteria score, when the contract evaluated one.
    pub score: Option<f64>,
    /// Zero-based index of the batch the item ran in.
    pub batch: usize,
}

impl ItemResult {
    pub(crate) fn new(item: &WorkItem, agent: impl Into<String>) -> Self {
        Self {
            item_id: item.id.clone(),
            description: item.description.clone(),
            success: false,
            output: None,
            error: None,
            error_code: None,
            agent: agent.into(),
            resources_consumed: ResourceAmounts::new(),
            execution_time: Duration::ZERO,
            contract_id: None,
            contract_state: None,
            quality_score: None,
            score: None,
            batch: 0,
        }
    }

    pub(crate) fn failed(
        item: &WorkItem,
        agent: impl Into<String>,
        code: ErrorCode,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(item, agent);
        result.error = Some(error.into());
        result.error_code = Some(code);
        result
    }

    pub(crate) fn with_contract(mut self, contract: &Contract) -> Self {
        self.contract_id = Some(contract.id());
        self.contract_state = Some(contract.state());
        self
    }

    pub fn consumed(&self, dimension: ResourceDimension) -> f64 {
        self.resources_consumed.get(&dimension).copied().unwrap_or(0.0)
    }
}

/// Aggregate over every item a scheduler has run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub average_execution_time: Duration,
    #[serde(with = "humantime_serde")]
    pub total_execution_time: Duration,
    pub agent_usage: BTreeMap<String, usize>,
    pub batches: usize,
}

impl ExecutionStats {
    pub fn from_results(results: &[ItemResult], batches: usize) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let total_execution_time: Duration = results.iter().map(|r| r.execution_time).sum();

        let mut agent_usage = BTreeMap::new();
        for result in results {
            *agent_usage.entry(result.agent.clone()).or_insert(0) += 1;
        }

        Self {
            total,
            successful,
            failed: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            average_execution_time: if total == 0 {
                Duration::ZERO
            } else {
                total_execution_time / total as u32
            },
            total_execution_time,
            agent_usage,
            batches,
        }
    }
}
