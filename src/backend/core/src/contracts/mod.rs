//! Resource Contracts
//!
//! A contract is a bounded, time-limited grant to consume resources. Each
//! contract owns a [`ResourceLedger`] and a [`TemporalWindow`], moves through
//! a one-way state machine, and may hold a weak reference to a parent.
//!
//! Children charge every consumption to their own ledger *and* to the
//! delegated counter of each ancestor, so the conservation law
//! `Σ child.consumed + parent.consumed ≤ parent.budget` holds after every
//! single `consume` call, not only at allocation time.
//!
//! ```text
//! Drafted ──activate──▶ Active ──┬──▶ Fulfilled
//!                                ├──▶ Violated
//!                                ├──▶ Expired
//!                                └──▶ Terminated
//! ```

mod dimension;
mod enforcement;
mod ledger;
mod limits;
mod terms;
mod window;

pub use dimension::ResourceDimension;
pub use enforcement::{
    AllocationStrategy, ConservationEnforcer, ConservationReport, DimensionAudit,
    EnforcementConfig, EnforcementStats, ThresholdLevel,
};
pub use ledger::{LedgerRejection, ResourceAmounts, ResourceLedger};
pub use limits::{ContractMode, ContractPreset, ModeDefaults, ResourceBudgets};
pub use terms::{
    ContractSnapshot, InputKind, InputSpec, OutputSpec, Predicate, Skill, SkillSet,
    SuccessCriteria, SuccessCriterion, TerminationCondition, TerminationConditions,
};
pub use window::TemporalWindow;

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CovenantError, ErrorCode, Result};
use crate::telemetry::metrics::ContractMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Contract State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ContractState {
    /// Parameters fixed, execution not begun
    Drafted = 0,
    /// Window running, consumption accepted
    Active = 1,
    /// Success criteria met
    Fulfilled = 2,
    /// A resource budget was breached
    Violated = 3,
    /// The temporal window elapsed
    Expired = 4,
    /// Cancelled externally or by a termination condition
    Terminated = 5,
}

impl ContractState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Drafted,
            1 => Self::Active,
            2 => Self::Fulfilled,
            3 => Self::Violated,
            4 => Self::Expired,
            _ => Self::Terminated,
        }
    }

    /// Terminal states are absorbing.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Drafted | Self::Active)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Active => "active",
            Self::Fulfilled => "fulfilled",
            Self::Violated => "violated",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a contract's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub at: DateTime<Utc>,
    pub from: Option<ContractState>,
    pub to: ContractState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Check Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of [`Contract::can_proceed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceedCheck {
    pub allowed: bool,
    pub reason: String,
    /// Highest threshold level across finite dimensions
    pub level: ThresholdLevel,
    pub warnings: Vec<String>,
}

impl ProceedCheck {
    fn ok(level: ThresholdLevel, warnings: Vec<String>) -> Self {
        Self {
            allowed: true,
            reason: "OK".to_string(),
            level,
            warnings,
        }
    }

    fn denied(reason: impl Into<String>, level: ThresholdLevel) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            level,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of [`Contract::evaluate_success`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessEvaluation {
    pub fulfilled: bool,
    pub score: f64,
}

/// Serializable status view of a contract.
///
/// Unbounded budgets serialize as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractStatus {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub state: ContractState,
    pub mode: ContractMode,
    pub consumption: ResourceAmounts,
    pub delegated: ResourceAmounts,
    pub utilization: ResourceAmounts,
    pub max_utilization: f64,
    pub aggregate_max_utilization: f64,
    pub time_remaining_secs: f64,
    pub budgets: BTreeMap<ResourceDimension, Option<f64>>,
    pub is_expired: bool,
    pub is_violated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// A resource contract.
///
/// Shared as `Arc<Contract>`; every operation takes `&self`.
pub struct Contract {
    id: Uuid,
    mode: ContractMode,
    ledger: ResourceLedger,
    window: TemporalWindow,
    state: AtomicU8,
    parent: Option<Weak<Contract>>,
    parent_id: Option<Uuid>,
    success: SuccessCriteria,
    termination: TerminationConditions,
    output_spec: OutputSpec,
    input_spec: InputSpec,
    skills: SkillSet,
    history: Mutex<Vec<StateTransition>>,
    created_at: DateTime<Utc>,
}

impl Contract {
    /// A contract with the defaults of `mode` and no extra terms.
    pub fn new(mode: ContractMode) -> Result<Self> {
        ContractBuilder::new(mode).build()
    }

    /// A contract built from a preset.
    pub fn from_preset(preset: ContractPreset) -> Result<Self> {
        preset.builder().build()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> ContractMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[inline]
    pub fn state(&self) -> ContractState {
        ContractState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContractState::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_violated(&self) -> bool {
        self.state() == ContractState::Violated
    }

    /// Expired either by state or by an elapsed window.
    pub fn is_expired(&self) -> bool {
        self.state() == ContractState::Expired || self.window.is_expired()
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// The parent, if one was set and is still alive.
    pub fn parent(&self) -> Option<Arc<Contract>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn window(&self) -> &TemporalWindow {
        &self.window
    }

    pub fn budget(&self, dimension: ResourceDimension) -> f64 {
        self.ledger.budget(dimension)
    }

    pub fn budgets(&self) -> ResourceBudgets {
        self.ledger.budgets()
    }

    pub fn consumed(&self, dimension: ResourceDimension) -> f64 {
        self.ledger.consumed(dimension)
    }

    pub fn delegated(&self, dimension: ResourceDimension) -> f64 {
        self.ledger.delegated(dimension)
    }

    pub fn utilization(&self, dimension: ResourceDimension) -> f64 {
        self.ledger.utilization(dimension)
    }

    /// Utilization counting consumption charged by descendants.
    pub fn aggregate_utilization(&self, dimension: ResourceDimension) -> f64 {
        self.ledger.aggregate_utilization(dimension)
    }

    pub fn max_utilization(&self) -> f64 {
        self.ledger.max_utilization()
    }

    /// Max utilization counting descendants. Drives batch sizing.
    pub fn aggregate_max_utilization(&self) -> f64 {
        self.ledger.aggregate_max_utilization()
    }

    pub fn time_remaining(&self) -> Duration {
        self.window.time_remaining()
    }

    pub fn success_criteria(&self) -> &SuccessCriteria {
        &self.success
    }

    pub fn output_spec(&self) -> &OutputSpec {
        &self.output_spec
    }

    pub fn skills(&self) -> &SkillSet {
        &self.skills
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        self.history.lock().clone()
    }

    /// Change a budget. Only legal while Drafted.
    pub fn set_budget(&self, dimension: ResourceDimension, value: f64) -> Result<()> {
        let state = self.state();
        if state != ContractState::Drafted {
            return Err(CovenantError::ledger_sealed(dimension).with_context("state", state));
        }
        self.ledger.set_budget(dimension, value)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State machine
    // ─────────────────────────────────────────────────────────────────────────

    /// Move `from -> to` if the current state is still `from`.
    fn transition(&self, from: ContractState, to: ContractState, reason: Option<&str>) -> bool {
        let mut history = self.history.lock();
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        history.push(StateTransition {
            at: Utc::now(),
            from: Some(from),
            to,
            reason: reason.map(str::to_string),
        });
        drop(history);

        ContractMetrics::record_transition(to);
        match to {
            ContractState::Violated | ContractState::Expired => warn!(
                contract_id = %self.id,
                from = %from,
                to = %to,
                reason = reason.unwrap_or_default(),
                "Contract state transition"
            ),
            _ => info!(
                contract_id = %self.id,
                from = %from,
                to = %to,
                reason = reason.unwrap_or_default(),
                "Contract state transition"
            ),
        }
        true
    }

    fn not_active(&self, attempted: ContractState) -> CovenantError {
        let state = self.state();
        if state.is_terminal() {
            CovenantError::new(
                ErrorCode::ContractTerminated,
                format!("Contract not active (state: {})", state),
            )
            .with_context("contract_id", self.id)
        } else {
            CovenantError::invalid_state_transition(self.id, state, attempted)
        }
    }

    /// Whether `child_budgets` fit inside this contract's budgets.
    ///
    /// Rejects when any finite dimension here is smaller than the child's.
    pub fn check_conservation(&self, child_budgets: &ResourceBudgets) -> bool {
        child_budgets.fits_within(&self.budgets())
    }

    /// Drafted → Active.
    ///
    /// With a parent, the budgets must pass the parent's conservation check
    /// and the parent must itself be active; otherwise the contract stays
    /// Drafted and a `ConservationViolation` is returned.
    pub fn activate(&self) -> Result<()> {
        let state = self.state();
        if state != ContractState::Drafted {
            return Err(CovenantError::invalid_state_transition(
                self.id,
                state,
                ContractState::Active,
            ));
        }

        if let Some(weak) = &self.parent {
            let parent = weak.upgrade().ok_or_else(|| {
                CovenantError::new(
                    ErrorCode::ConservationViolation,
                    "Parent contract no longer exists",
                )
                .with_context("contract_id", self.id)
            })?;

            if !parent.is_active() {
                return Err(CovenantError::new(
                    ErrorCode::ConservationViolation,
                    format!("Parent contract is not active (state: {})", parent.state()),
                )
                .with_context("contract_id", self.id)
                .with_context("parent_id", parent.id));
            }

            if let Some((dim, parent_budget, child_budget)) =
                self.budgets().first_excess(&parent.budgets())
            {
                debug!(
                    contract_id = %self.id,
                    parent_id = %parent.id,
                    dimension = %dim,
                    "Activation refused by parent conservation check"
                );
                return Err(CovenantError::conservation_violation(dim, parent_budget, child_budget)
                    .with_context("contract_id", self.id));
            }
        }

        self.ledger.seal();
        if !self.transition(ContractState::Drafted, ContractState::Active, None) {
            return Err(CovenantError::invalid_state_transition(
                self.id,
                self.state(),
                ContractState::Active,
            ));
        }
        self.window.start();
        Ok(())
    }

    /// Consume `amount` of `dimension`. `false` on any refusal.
    #[inline]
    pub fn consume(&self, dimension: ResourceDimension, amount: f64) -> bool {
        self.try_consume(dimension, amount).is_ok()
    }

    /// Consume `amount` of `dimension`, reporting why a refusal happened.
    ///
    /// Charges the own ledger first, then every ancestor's delegated counter
    /// from the nearest outwards; the charge lands everywhere or nowhere. A
    /// charge the own budget refuses never reaches shared ancestors. A budget
    /// refusal moves the contract to Violated. Invalid amounts are refused
    /// without a state change.
    pub fn try_consume(&self, dimension: ResourceDimension, amount: f64) -> Result<()> {
        if !self.is_active() {
            return Err(self.not_active(ContractState::Active));
        }

        if let Err(rejection) = self.ledger.consume(dimension, amount) {
            return Err(self.reject(dimension, rejection, None));
        }

        let mut charged: Vec<Arc<Contract>> = Vec::new();
        let mut ancestor = self.parent();
        while let Some(contract) = ancestor {
            if let Err(rejection) = contract.ledger.delegate(dimension, amount) {
                refund_ancestors(&charged, dimension, amount);
                self.ledger.refund(dimension, amount);
                return Err(self.reject(dimension, rejection, Some(contract.id)));
            }
            ancestor = contract.parent();
            charged.push(contract);
        }

        ContractMetrics::record_consumption(dimension, amount);
        Ok(())
    }

    fn reject(
        &self,
        dimension: ResourceDimension,
        rejection: LedgerRejection,
        refused_by: Option<Uuid>,
    ) -> CovenantError {
        ContractMetrics::record_rejection(dimension);

        if let LedgerRejection::Exhausted { .. } = rejection {
            let reason = match refused_by {
                Some(ancestor) => format!(
                    "Resource {} exhausted in ancestor contract {}",
                    dimension, ancestor
                ),
                None => format!("Resource {} exhausted", dimension),
            };
            self.transition(ContractState::Active, ContractState::Violated, Some(&reason));
        }

        let error = rejection.into_error(dimension).with_context("contract_id", self.id);
        match refused_by {
            Some(ancestor) => error.with_context("refused_by", ancestor),
            None => error,
        }
    }

    /// Composite precondition check, run before every unit of work.
    ///
    /// Refuses (and transitions) on an elapsed window, an exhausted finite
    /// dimension or a triggered termination condition. Repeated calls on a
    /// healthy contract change nothing.
    pub fn can_proceed(&self) -> ProceedCheck {
        let state = self.state();
        if state != ContractState::Active {
            return ProceedCheck::denied(
                format!("Contract not active (state: {})", state),
                ThresholdLevel::Normal,
            );
        }

        if self.window.is_expired() {
            let reason = "Contract expired (time limit exceeded)";
            self.transition(ContractState::Active, ContractState::Expired, Some(reason));
            return ProceedCheck::denied(reason, ThresholdLevel::Exceeded);
        }

        if let Some(dimension) = self.ledger.exhausted_dimension() {
            let reason = format!("Resource {} exhausted", dimension);
            self.transition(ContractState::Active, ContractState::Violated, Some(&reason));
            return ProceedCheck::denied(reason, ThresholdLevel::Exceeded);
        }

        let snapshot = self.snapshot();
        if let Some(name) = self.termination.triggered(&snapshot) {
            let reason = format!("Termination condition met: {}", name);
            self.transition(ContractState::Active, ContractState::Terminated, Some(&reason));
            return ProceedCheck::denied(reason, self.threshold_level());
        }

        let mut level = ThresholdLevel::Normal;
        let mut warnings = Vec::new();
        for (dimension, _) in self.ledger.budgets().iter() {
            let utilization = self.aggregate_utilization(dimension);
            let dim_level = ThresholdLevel::from_percentage(utilization);
            level = level.max(dim_level);
            if dim_level >= ThresholdLevel::Warning {
                let warning = format!("{} at {:.1}% of budget", dimension, utilization * 100.0);
                warn!(contract_id = %self.id, threshold = ?dim_level, warning = %warning, "Contract limit warning");
                warnings.push(warning);
            }
        }

        ProceedCheck::ok(level, warnings)
    }

    fn threshold_level(&self) -> ThresholdLevel {
        ThresholdLevel::from_percentage(self.aggregate_max_utilization())
    }

    /// Score the output against the success criteria.
    ///
    /// Fulfills the contract when the weighted score reaches the threshold and
    /// `quality_score` meets the output specification; otherwise the state is
    /// left untouched. Errors unless the contract is Active.
    pub fn evaluate_success(&self, output: &str, quality_score: f64) -> Result<SuccessEvaluation> {
        if !self.is_active() {
            return Err(CovenantError::invalid_state_transition(
                self.id,
                self.state(),
                ContractState::Fulfilled,
            ));
        }

        let mut snapshot = self.snapshot();
        snapshot.output = Some(output.to_string());
        snapshot.quality_score = Some(quality_score);

        let (criteria_met, score) = self.success.evaluate(&snapshot);
        let quality_met = self.output_spec.meets_quality(quality_score);

        let fulfilled = criteria_met
            && quality_met
            && self.transition(
                ContractState::Active,
                ContractState::Fulfilled,
                Some("Success criteria met"),
            );

        debug!(
            contract_id = %self.id,
            score = score,
            quality_score = quality_score,
            fulfilled = fulfilled,
            "Success evaluated"
        );

        Ok(SuccessEvaluation { fulfilled, score })
    }

    /// Active → Terminated.
    pub fn terminate(&self, reason: &str) -> Result<()> {
        if self.transition(ContractState::Active, ContractState::Terminated, Some(reason)) {
            Ok(())
        } else {
            Err(CovenantError::invalid_state_transition(
                self.id,
                self.state(),
                ContractState::Terminated,
            ))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot handed to success and termination predicates.
    pub fn snapshot(&self) -> ContractSnapshot {
        ContractSnapshot {
            contract_id: self.id,
            state: self.state(),
            consumption: self.ledger.consumption(),
            utilization: self.finite_utilization(),
            max_utilization: self.max_utilization(),
            elapsed: self.window.elapsed(),
            output: None,
            quality_score: None,
        }
    }

    fn finite_utilization(&self) -> ResourceAmounts {
        self.ledger
            .budgets()
            .iter()
            .map(|(dim, _)| (dim, self.utilization(dim)))
            .collect()
    }

    pub fn status(&self) -> ContractStatus {
        let budgets = ResourceDimension::ALL
            .into_iter()
            .map(|dim| {
                let budget = self.budget(dim);
                (dim, budget.is_finite().then_some(budget))
            })
            .collect();

        ContractStatus {
            id: self.id,
            parent_id: self.parent_id,
            state: self.state(),
            mode: self.mode,
            consumption: self.ledger.consumption(),
            delegated: self.ledger.delegation(),
            utilization: ResourceDimension::ALL
                .into_iter()
                .map(|dim| (dim, self.utilization(dim)))
                .collect(),
            max_utilization: self.max_utilization(),
            aggregate_max_utilization: self.aggregate_max_utilization(),
            time_remaining_secs: self.time_remaining().as_secs_f64(),
            budgets,
            is_expired: self.is_expired(),
            is_violated: self.is_violated(),
            started_at: self.window.started_at(),
        }
    }

    /// Check structured input against the input specification.
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<()> {
        self.input_spec
            .validate(input)
            .map_err(CovenantError::input_rejected)
    }

    /// Prefix `base_prompt` with the contract's current budget position.
    pub fn render_budget_prompt(&self, base_prompt: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "## RESOURCE BUDGET (Contract Mode: {})\n",
            self.mode.as_str().to_uppercase()
        );
        out.push_str("You are operating under a resource contract with the following constraints:\n\n");

        for (dim, budget) in self.ledger.budgets().iter() {
            let _ = writeln!(
                out,
                "- {}: {:.0} / {:.0} ({:.1}%)",
                dim.as_str().to_uppercase(),
                self.consumed(dim),
                budget,
                self.utilization(dim) * 100.0
            );
        }

        let _ = writeln!(
            out,
            "\nTime Remaining: {:.0} seconds",
            self.time_remaining().as_secs_f64()
        );
        let _ = writeln!(
            out,
            "Overall Utilization: {:.1}%\n",
            self.max_utilization() * 100.0
        );

        out.push_str("## BUDGET AWARENESS INSTRUCTIONS\n\n");
        out.push_str("- Monitor your resource consumption carefully\n");
        out.push_str("- When utilization is high (>80%), be concise and efficient\n");
        out.push_str("- Stop and report completion if running low on budget\n");
        out.push_str("- Do NOT exceed the specified resource limits\n");
        for requirement in &self.output_spec.formatting {
            let _ = writeln!(out, "- {}", requirement);
        }

        out.push('\n');
        out.push_str(base_prompt);
        out
    }
}

fn refund_ancestors(charged: &[Arc<Contract>], dimension: ResourceDimension, amount: f64) {
    for contract in charged {
        contract.ledger.refund_delegated(dimension, amount);
    }
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contract")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("parent_id", &self.parent_id)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`Contract`].
#[derive(Debug, Clone)]
pub struct ContractBuilder {
    mode: ContractMode,
    defaults: ModeDefaults,
    overrides: Vec<(ResourceDimension, f64)>,
    duration: Option<Duration>,
    success: SuccessCriteria,
    termination: TerminationConditions,
    output_spec: OutputSpec,
    input_spec: InputSpec,
    skills: SkillSet,
    parent: Option<(Weak<Contract>, Uuid)>,
}

impl ContractBuilder {
    pub fn new(mode: ContractMode) -> Self {
        Self::with_defaults(mode, mode.defaults())
    }

    /// Start from custom defaults instead of the fixed ones of `mode`.
    pub fn with_defaults(mode: ContractMode, defaults: ModeDefaults) -> Self {
        Self {
            mode,
            defaults,
            overrides: Vec::new(),
            duration: None,
            success: SuccessCriteria::default(),
            termination: TerminationConditions::default(),
            output_spec: OutputSpec::default(),
            input_spec: InputSpec::default(),
            skills: SkillSet::default(),
            parent: None,
        }
    }

    /// Override one budget. `f64::INFINITY` removes a mode default.
    pub fn budget(mut self, dimension: ResourceDimension, value: f64) -> Self {
        self.overrides.push((dimension, value));
        self
    }

    pub fn budgets(mut self, budgets: &ResourceBudgets) -> Self {
        self.overrides.extend(budgets.iter());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn success_criterion<F>(mut self, name: impl Into<String>, weight: f64, predicate: F) -> Self
    where
        F: Fn(&ContractSnapshot) -> bool + Send + Sync + 'static,
    {
        self.success.push(SuccessCriterion::new(name, weight, predicate));
        self
    }

    pub fn success_threshold(mut self, threshold: f64) -> Self {
        self.success.set_threshold(threshold);
        self
    }

    pub fn termination_condition<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ContractSnapshot) -> bool + Send + Sync + 'static,
    {
        self.termination.push(TerminationCondition::new(name, predicate));
        self
    }

    pub fn output_spec(mut self, spec: OutputSpec) -> Self {
        self.output_spec = spec;
        self
    }

    pub fn min_quality(mut self, min_quality: f64) -> Self {
        self.output_spec.min_quality = min_quality;
        self
    }

    pub fn input_spec(mut self, spec: InputSpec) -> Self {
        self.input_spec = spec;
        self
    }

    pub fn skills(mut self, skills: SkillSet) -> Self {
        self.skills = skills;
        self
    }

    pub fn parent(mut self, parent: &Arc<Contract>) -> Self {
        self.parent = Some((Arc::downgrade(parent), parent.id));
        self
    }

    /// Validate and construct a Drafted contract.
    pub fn build(self) -> Result<Contract> {
        let mut budgets = self.defaults.budgets();
        for (dim, value) in &self.overrides {
            budgets.set(*dim, *value);
        }
        budgets.validate()?;

        let duration = self.duration.unwrap_or(self.defaults.duration);
        if duration.is_zero() {
            return Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                "Contract duration must be positive",
            ));
        }

        let threshold = self.success.threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CovenantError::invalid_threshold("success_threshold", threshold));
        }
        if let Some(criterion) = self
            .success
            .criteria()
            .iter()
            .find(|c| !c.weight.is_finite() || c.weight < 0.0)
        {
            return Err(CovenantError::invalid_threshold(
                &format!("weight of {}", criterion.name),
                criterion.weight,
            ));
        }
        let min_quality = self.output_spec.min_quality;
        if !(0.0..=1.0).contains(&min_quality) {
            return Err(CovenantError::invalid_threshold("min_quality", min_quality));
        }

        let ledger = ResourceLedger::with_budgets(&budgets)?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let (parent, parent_id) = match self.parent {
            Some((weak, id)) => (Some(weak), Some(id)),
            None => (None, None),
        };

        ContractMetrics::record_created(self.mode);
        debug!(
            contract_id = %id,
            mode = %self.mode,
            parent_id = ?parent_id,
            duration_secs = duration.as_secs_f64(),
            "Contract drafted"
        );

        Ok(Contract {
            id,
            mode: self.mode,
            ledger,
            window: TemporalWindow::new(duration),
            state: AtomicU8::new(ContractState::Drafted as u8),
            parent,
            parent_id,
            success: self.success,
            termination: self.termination,
            output_spec: self.output_spec,
            input_spec: self.input_spec,
            skills: self.skills,
            history: Mutex::new(vec![StateTransition {
                at: created_at,
                from: None,
                to: ContractState::Drafted,
                reason: None,
            }]),
            created_at,
        })
    }
}
