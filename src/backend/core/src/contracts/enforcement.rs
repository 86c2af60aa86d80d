//! Conservation Enforcement - child allocation and post-hoc audits.
//!
//! The `ConservationEnforcer` is responsible for:
//! - Computing child budgets from the root's buffered capacity
//! - Creating unactivated child contracts bound to the root
//! - Counting activations the root refused
//! - Auditing `Σ child.consumed + root.consumed ≤ root.budget` on demand
//!
//! The audit is for tests and observability. The blocking gates are the
//! activation check and the delegated charge every child consumption makes.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Contract, ContractBuilder, ContractMode, ResourceBudgets, ResourceDimension};
use crate::error::{CovenantError, ErrorCode, Result};
use crate::telemetry::metrics::ContractMetrics;

/// Relative slack for float summation differences in the audit.
const AUDIT_TOLERANCE: f64 = 1e-9;

/// Threshold levels for utilization warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    /// Under 70% usage
    Normal,
    /// 70-90% usage
    Warning,
    /// 90-100% usage
    Critical,
    /// At or over 100% usage
    Exceeded,
}

impl ThresholdLevel {
    /// Get threshold level from a utilization ratio (0.0 - 1.0+).
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= 1.0 {
            ThresholdLevel::Exceeded
        } else if pct >= 0.9 {
            ThresholdLevel::Critical
        } else if pct >= 0.7 {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }
}

/// How a child's share of the root budget is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Split the buffered budget evenly between existing children and one more
    #[default]
    Equal,
    /// Weighted by declared need; currently computed as `Equal`
    Proportional,
    /// Agreed with the child; currently computed as `Equal`
    Negotiated,
}

impl AllocationStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::Proportional => "proportional",
            Self::Negotiated => "negotiated",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = CovenantError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equal" => Ok(Self::Equal),
            "proportional" => Ok(Self::Proportional),
            "negotiated" => Ok(Self::Negotiated),
            other => Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                format!("Unknown allocation strategy: {}", other),
            )),
        }
    }
}

/// Configuration for conservation enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Fraction of each root budget held back from children (0.0 - <1.0)
    #[serde(default = "default_reserve_buffer")]
    pub reserve_buffer: f64,

    /// Allocation strategy for new children
    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Whether child windows are clamped to the root's remaining time
    #[serde(default = "default_clamp_child_duration")]
    pub clamp_child_duration: bool,
}

fn default_reserve_buffer() -> f64 {
    0.15
}

fn default_clamp_child_duration() -> bool {
    true
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            reserve_buffer: default_reserve_buffer(),
            strategy: AllocationStrategy::default(),
            clamp_child_duration: default_clamp_child_duration(),
        }
    }
}

impl EnforcementConfig {
    pub fn with_reserve_buffer(mut self, reserve_buffer: f64) -> Self {
        self.reserve_buffer = reserve_buffer;
        self
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_reserve_buffer(self.reserve_buffer)
    }
}

fn validate_reserve_buffer(reserve_buffer: f64) -> Result<()> {
    if (0.0..1.0).contains(&reserve_buffer) {
        Ok(())
    } else {
        Err(CovenantError::invalid_threshold("reserve_buffer", reserve_buffer))
    }
}

/// Audit of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionAudit {
    pub dimension: ResourceDimension,
    pub budget: f64,
    pub root_consumed: f64,
    pub children_consumed: f64,
    pub total: f64,
    pub holds: bool,
}

/// Result of [`ConservationEnforcer::conservation_report`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservationReport {
    pub root_id: Uuid,
    pub children: usize,
    pub holds: bool,
    pub dimensions: Vec<DimensionAudit>,
}

impl ConservationReport {
    /// Dimensions where the law does not hold.
    pub fn violations(&self) -> impl Iterator<Item = &DimensionAudit> {
        self.dimensions.iter().filter(|d| !d.holds)
    }
}

/// Allocates child contracts under a root and audits conservation.
pub struct ConservationEnforcer {
    config: EnforcementConfig,
    root: Arc<Contract>,
    children: RwLock<Vec<Arc<Contract>>>,
    children_created: AtomicU64,
    children_released: AtomicU64,
    activations_refused: AtomicU64,
    audits_run: AtomicU64,
    audits_failed: AtomicU64,
}

impl ConservationEnforcer {
    /// Create an enforcer with the default configuration.
    pub fn new(root: Arc<Contract>) -> Self {
        Self::build(EnforcementConfig::default(), root)
    }

    /// Create with custom configuration.
    pub fn with_config(config: EnforcementConfig, root: Arc<Contract>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, root))
    }

    fn build(config: EnforcementConfig, root: Arc<Contract>) -> Self {
        Self {
            config,
            root,
            children: RwLock::new(Vec::new()),
            children_created: AtomicU64::new(0),
            children_released: AtomicU64::new(0),
            activations_refused: AtomicU64::new(0),
            audits_run: AtomicU64::new(0),
            audits_failed: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Arc<Contract> {
        &self.root
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.config
    }

    /// Registered children, including finished ones.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn children(&self) -> Vec<Arc<Contract>> {
        self.children.read().clone()
    }

    /// Budgets the next child would receive.
    ///
    /// For each finite root dimension: `budget × (1 − reserve_buffer)` split
    /// over `existing children + 1`.
    pub fn allocate_child_budget(
        &self,
        strategy: AllocationStrategy,
        reserve_buffer: f64,
    ) -> Result<ResourceBudgets> {
        validate_reserve_buffer(reserve_buffer)?;
        Ok(self.allocate_for(self.child_count(), strategy, reserve_buffer))
    }

    fn allocate_for(
        &self,
        existing_children: usize,
        strategy: AllocationStrategy,
        reserve_buffer: f64,
    ) -> ResourceBudgets {
        if strategy != AllocationStrategy::Equal {
            tracing::debug!(
                strategy = %strategy,
                "Allocation strategy not specialised, using equal split"
            );
        }

        let shares = (existing_children + 1) as f64;
        self.root
            .budgets()
            .iter()
            .map(|(dim, budget)| (dim, budget * (1.0 - reserve_buffer) / shares))
            .collect()
    }

    /// Allocate, construct and register a Drafted child of `mode`.
    ///
    /// The caller activates it; activation re-checks the budgets against the
    /// root.
    pub fn create_child_contract(&self, mode: ContractMode) -> Result<Arc<Contract>> {
        let mut children = self.children.write();

        let budgets = self.allocate_for(
            children.len(),
            self.config.strategy,
            self.config.reserve_buffer,
        );

        let mut builder = ContractBuilder::new(mode)
            .parent(&self.root)
            .budgets(&budgets);

        if self.config.clamp_child_duration && self.root.is_active() {
            let remaining = self.root.time_remaining();
            if remaining.is_zero() {
                return Err(CovenantError::contract_expired(self.root.id()));
            }
            builder = builder.duration(mode.defaults().duration.min(remaining));
        }

        let child = Arc::new(builder.build()?);
        children.push(Arc::clone(&child));
        drop(children);

        self.children_created.fetch_add(1, Ordering::Relaxed);
        ContractMetrics::record_child_allocated();

        tracing::debug!(
            root_id = %self.root.id(),
            child_id = %child.id(),
            mode = %mode,
            budgets = ?budgets,
            "Child contract allocated"
        );

        Ok(child)
    }

    /// Activate a child created by this enforcer, counting refusals.
    pub fn activate_child(&self, child: &Arc<Contract>) -> Result<()> {
        child.activate().map_err(|e| {
            self.activations_refused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                root_id = %self.root.id(),
                child_id = %child.id(),
                error = %e,
                "Child activation refused"
            );
            e
        })
    }

    /// Deregister a child that never activated.
    ///
    /// Returns `false` if the child is unknown or already activated.
    pub fn release_child(&self, child: &Arc<Contract>) -> bool {
        if child.state() != super::ContractState::Drafted {
            return false;
        }
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|c| !Arc::ptr_eq(c, child));
        let released = children.len() < before;
        if released {
            self.children_released.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    /// Whether the conservation law currently holds.
    pub fn verify_conservation(&self) -> bool {
        self.conservation_report().holds
    }

    /// Per-dimension audit of actual consumption against the root budget.
    pub fn conservation_report(&self) -> ConservationReport {
        let children = self.children.read();

        let dimensions: Vec<DimensionAudit> = self
            .root
            .budgets()
            .iter()
            .map(|(dimension, budget)| {
                let root_consumed = self.root.consumed(dimension);
                let children_consumed: f64 = children.iter().map(|c| c.consumed(dimension)).sum();
                let total = root_consumed + children_consumed;
                DimensionAudit {
                    dimension,
                    budget,
                    root_consumed,
                    children_consumed,
                    total,
                    holds: total <= budget + budget.abs().max(1.0) * AUDIT_TOLERANCE,
                }
            })
            .collect();

        let holds = dimensions.iter().all(|d| d.holds);
        let report = ConservationReport {
            root_id: self.root.id(),
            children: children.len(),
            holds,
            dimensions,
        };
        drop(children);

        self.audits_run.fetch_add(1, Ordering::Relaxed);
        if !holds {
            self.audits_failed.fetch_add(1, Ordering::Relaxed);
            for audit in report.violations() {
                tracing::error!(
                    root_id = %report.root_id,
                    dimension = %audit.dimension,
                    budget = audit.budget,
                    total = audit.total,
                    "Conservation law violated"
                );
            }
        }

        report
    }

    /// Get enforcement statistics.
    pub fn stats(&self) -> EnforcementStats {
        let children = self.children.read();
        EnforcementStats {
            children_created: self.children_created.load(Ordering::Relaxed),
            children_registered: children.len() as u64,
            children_active: children.iter().filter(|c| c.is_active()).count() as u64,
            children_released: self.children_released.load(Ordering::Relaxed),
            activations_refused: self.activations_refused.load(Ordering::Relaxed),
            audits_run: self.audits_run.load(Ordering::Relaxed),
            audits_failed: self.audits_failed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ConservationEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConservationEnforcer")
            .field("config", &self.config)
            .field("root_id", &self.root.id())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Enforcement statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementStats {
    pub children_created: u64,
    pub children_registered: u64,
    pub children_active: u64,
    pub children_released: u64,
    pub activations_refused: u64,
    pub audits_run: u64,
    pub audits_failed: u64,
}

impl EnforcementStats {
    /// Refused activations as a percentage of created children.
    pub fn refusal_rate(&self) -> f64 {
        if self.children_created == 0 {
            0.0
        } else {
            (self.activations_refused as f64 / self.children_created as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ContractState;
    use std::time::Duration;
    use ResourceDimension::*;

    fn test_root(tokens: f64) -> Arc<Contract> {
        let root = ContractBuilder::new(ContractMode::Balanced)
            .budget(Tokens, tokens)
            .build()
            .unwrap();
        Arc::new(root)
    }

    #[test]
    fn test_threshold_levels() {
        assert_eq!(ThresholdLevel::from_percentage(0.5), ThresholdLevel::Normal);
        assert_eq!(ThresholdLevel::from_percentage(0.7), ThresholdLevel::Warning);
        assert_eq!(ThresholdLevel::from_percentage(0.95), ThresholdLevel::Critical);
        assert_eq!(ThresholdLevel::from_percentage(1.0), ThresholdLevel::Exceeded);
    }

    #[test]
    fn test_allocation_applies_reserve_buffer() {
        let enforcer = ConservationEnforcer::new(test_root(1_000.0));
        let budgets = enforcer
            .allocate_child_budget(AllocationStrategy::Equal, 0.15)
            .unwrap();

        assert!((budgets.get(Tokens) - 850.0).abs() < 1e-9);
        assert!((budgets.get(Iterations) - 8.5).abs() < 1e-9);
        assert!(budgets.get(ApiCalls).is_infinite());
    }

    #[test]
    fn test_invalid_reserve_buffer() {
        let enforcer = ConservationEnforcer::new(test_root(1_000.0));
        assert!(enforcer
            .allocate_child_budget(AllocationStrategy::Equal, 1.0)
            .is_err());
        assert!(enforcer
            .allocate_child_budget(AllocationStrategy::Equal, -0.1)
            .is_err());

        let config = EnforcementConfig::default().with_reserve_buffer(1.5);
        let err = ConservationEnforcer::with_config(config, test_root(1.0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidThreshold);
    }

    #[test]
    fn test_allocation_shrinks_with_siblings() {
        let enforcer = ConservationEnforcer::new(test_root(1_000.0));

        let first = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
        let second = enforcer.create_child_contract(ContractMode::Balanced).unwrap();

        assert!(second.budget(Tokens) <= first.budget(Tokens));
        assert_eq!(first.state(), ContractState::Drafted);
        assert_eq!(first.parent_id(), Some(enforcer.root().id()));
        assert_eq!(enforcer.child_count(), 2);
    }

    #[test]
    fn test_non_equal_strategies_fall_back() {
        let enforcer = ConservationEnforcer::new(test_root(1_000.0));
        let equal = enforcer
            .allocate_child_budget(AllocationStrategy::Equal, 0.2)
            .unwrap();
        let proportional = enforcer
            .allocate_child_budget(AllocationStrategy::Proportional, 0.2)
            .unwrap();
        let negotiated = enforcer
            .allocate_child_budget(AllocationStrategy::Negotiated, 0.2)
            .unwrap();

        assert_eq!(equal, proportional);
        assert_eq!(equal, negotiated);
    }

    #[test]
    fn test_child_duration_clamped_to_root() {
        let root = Arc::new(
            ContractBuilder::new(ContractMode::Balanced)
                .duration(Duration::from_secs(10))
                .build()
                .unwrap(),
        );
        root.activate().unwrap();

        let enforcer = ConservationEnforcer::new(root);
        let child = enforcer.create_child_contract(ContractMode::Urgent).unwrap();
        assert!(child.window().duration() <= Duration::from_secs(10));
    }

    #[test]
    fn test_release_child() {
        let root = test_root(1_000.0);
        root.activate().unwrap();
        let enforcer = ConservationEnforcer::new(root);

        let drafted = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
        let active = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
        enforcer.activate_child(&active).unwrap();

        assert!(!enforcer.release_child(&active));
        assert!(enforcer.release_child(&drafted));
        assert!(!enforcer.release_child(&drafted));
        assert_eq!(enforcer.child_count(), 1);
        assert_eq!(enforcer.stats().children_released, 1);
    }

    #[test]
    fn test_refused_activation_is_counted() {
        let enforcer = ConservationEnforcer::new(test_root(1_000.0));
        let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();

        // root never activated
        assert!(enforcer.activate_child(&child).is_err());

        let stats = enforcer.stats();
        assert_eq!(stats.activations_refused, 1);
        assert_eq!(stats.refusal_rate(), 100.0);
    }

    #[test]
    fn test_report_sums_root_and_children() {
        let root = test_root(100.0);
        root.activate().unwrap();
        let config = EnforcementConfig::default().with_reserve_buffer(0.0);
        let enforcer = ConservationEnforcer::with_config(config, Arc::clone(&root)).unwrap();

        let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
        enforcer.activate_child(&child).unwrap();
        assert!(child.consume(Tokens, 40.0));
        assert!(root.consume(Tokens, 10.0));

        let report = enforcer.conservation_report();
        assert!(report.holds);
        let tokens = report
            .dimensions
            .iter()
            .find(|d| d.dimension == Tokens)
            .unwrap();
        assert_eq!(tokens.root_consumed, 10.0);
        assert_eq!(tokens.children_consumed, 40.0);
        assert_eq!(tokens.total, 50.0);
        assert_eq!(enforcer.stats().audits_run, 1);
    }
}
