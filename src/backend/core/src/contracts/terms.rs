//! Contract terms: success criteria, termination conditions, input/output
//! specifications and skill sets.
//!
//! Criteria and conditions are predicates over a [`ContractSnapshot`]. They are
//! supplied at construction and only ever evaluated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ContractState, ResourceAmounts, ResourceDimension};

/// A predicate evaluated against a contract snapshot.
pub type Predicate = Arc<dyn Fn(&ContractSnapshot) -> bool + Send + Sync>;

/// Point-in-time view of a contract handed to predicates.
#[derive(Debug, Clone)]
pub struct ContractSnapshot {
    pub contract_id: Uuid,
    pub state: ContractState,
    /// Own consumption per dimension
    pub consumption: ResourceAmounts,
    /// Utilization of finite-budget dimensions only
    pub utilization: ResourceAmounts,
    pub max_utilization: f64,
    pub elapsed: Duration,
    /// Present only during success evaluation
    pub output: Option<String>,
    /// Present only during success evaluation
    pub quality_score: Option<f64>,
}

impl ContractSnapshot {
    /// Own consumption of `dimension`.
    pub fn consumed(&self, dimension: ResourceDimension) -> f64 {
        self.consumption.get(&dimension).copied().unwrap_or(0.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Success Criteria
// ═══════════════════════════════════════════════════════════════════════════════

/// One weighted success predicate.
#[derive(Clone)]
pub struct SuccessCriterion {
    pub name: String,
    pub weight: f64,
    predicate: Predicate,
}

impl SuccessCriterion {
    pub fn new<F>(name: impl Into<String>, weight: f64, predicate: F) -> Self
    where
        F: Fn(&ContractSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            weight,
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_met(&self, snapshot: &ContractSnapshot) -> bool {
        (self.predicate)(snapshot)
    }
}

impl fmt::Debug for SuccessCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuccessCriterion")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Weighted predicates plus the threshold their sum must reach.
#[derive(Debug, Clone)]
pub struct SuccessCriteria {
    criteria: Vec<SuccessCriterion>,
    threshold: f64,
}

impl SuccessCriteria {
    pub const DEFAULT_THRESHOLD: f64 = 0.8;

    pub fn new(threshold: f64) -> Self {
        Self {
            criteria: Vec::new(),
            threshold,
        }
    }

    pub fn push(&mut self, criterion: SuccessCriterion) {
        self.criteria.push(criterion);
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn criteria(&self) -> &[SuccessCriterion] {
        &self.criteria
    }

    /// Weighted score of met criteria, and whether it reaches the threshold.
    ///
    /// An empty set scores 1.0.
    pub fn evaluate(&self, snapshot: &ContractSnapshot) -> (bool, f64) {
        if self.criteria.is_empty() {
            return (true, 1.0);
        }

        let score: f64 = self
            .criteria
            .iter()
            .filter(|c| c.is_met(snapshot))
            .map(|c| c.weight)
            .sum();

        (score >= self.threshold, score)
    }
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Termination Conditions
// ═══════════════════════════════════════════════════════════════════════════════

/// A named predicate that ends the contract when true.
#[derive(Clone)]
pub struct TerminationCondition {
    pub name: String,
    predicate: Predicate,
}

impl TerminationCondition {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ContractSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for TerminationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Disjunction of termination predicates.
#[derive(Debug, Clone, Default)]
pub struct TerminationConditions {
    conditions: Vec<TerminationCondition>,
}

impl TerminationConditions {
    pub fn push(&mut self, condition: TerminationCondition) {
        self.conditions.push(condition);
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Name of the first condition that holds.
    pub fn triggered(&self, snapshot: &ContractSnapshot) -> Option<&str> {
        self.conditions
            .iter()
            .find(|c| (c.predicate)(snapshot))
            .map(|c| c.name.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output / Input Specifications
// ═══════════════════════════════════════════════════════════════════════════════

/// Requirements on produced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Minimum acceptable quality score (0.0 - 1.0)
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,

    /// Free-form formatting requirements, rendered into budget prompts
    #[serde(default)]
    pub formatting: Vec<String>,
}

fn default_min_quality() -> f64 {
    0.8
}

impl OutputSpec {
    pub fn with_min_quality(min_quality: f64) -> Self {
        Self {
            min_quality,
            ..Self::default()
        }
    }

    pub fn meets_quality(&self, quality_score: f64) -> bool {
        quality_score >= self.min_quality
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            formatting: Vec::new(),
        }
    }
}

/// JSON type expected for an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl InputKind {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

type InputRule = Arc<dyn Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync>;

/// Required input fields plus custom validation rules.
#[derive(Clone, Default)]
pub struct InputSpec {
    required: BTreeMap<String, InputKind>,
    rules: Vec<InputRule>,
}

impl InputSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: InputKind) -> Self {
        self.required.insert(field.into(), kind);
        self
    }

    pub fn rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Check `input`, collecting every problem found.
    pub fn validate(&self, input: &serde_json::Value) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (field, kind) in &self.required {
            match input.get(field) {
                None => errors.push(format!("missing required input: {}", field)),
                Some(value) if !kind.matches(value) => {
                    errors.push(format!("invalid type for {}: expected {:?}", field, kind))
                }
                Some(_) => {}
            }
        }

        errors.extend(self.rules.iter().filter_map(|rule| rule(input).err()));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl fmt::Debug for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSpec")
            .field("required", &self.required)
            .field("rules", &self.rules.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Skill Set
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub cost: f64,
    pub success_probability: f64,
}

/// Capabilities available under a contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillSet(BTreeMap<String, Skill>);

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skill(mut self, name: impl Into<String>, cost: f64, success_probability: f64) -> Self {
        self.0.insert(
            name.into(),
            Skill {
                cost,
                success_probability,
            },
        );
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Cost of `name`; unknown skills cost 1.0.
    pub fn cost(&self, name: &str) -> f64 {
        self.0.get(name).map_or(1.0, |s| s.cost)
    }

    /// Success probability of `name`; unknown skills are assumed certain.
    pub fn success_probability(&self, name: &str) -> f64 {
        self.0.get(name).map_or(1.0, |s| s.success_probability)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ContractSnapshot {
        ContractSnapshot {
            contract_id: Uuid::new_v4(),
            state: ContractState::Active,
            consumption: [(ResourceDimension::Tokens, 400.0)].into_iter().collect(),
            utilization: [(ResourceDimension::Tokens, 0.4)].into_iter().collect(),
            max_utilization: 0.4,
            elapsed: Duration::from_secs(3),
            output: Some("done".to_string()),
            quality_score: Some(0.9),
        }
    }

    #[test]
    fn test_empty_criteria_score_one() {
        let criteria = SuccessCriteria::default();
        assert_eq!(criteria.evaluate(&snapshot()), (true, 1.0));
    }

    #[test]
    fn test_weighted_sum() {
        let mut criteria = SuccessCriteria::new(0.6);
        criteria.push(SuccessCriterion::new("has_output", 0.5, |s| s.output.is_some()));
        criteria.push(SuccessCriterion::new("cheap", 0.3, |s| {
            s.consumed(ResourceDimension::Tokens) < 100.0
        }));
        criteria.push(SuccessCriterion::new("quick", 0.2, |s| s.elapsed.as_secs() < 10));

        let (met, score) = criteria.evaluate(&snapshot());
        assert!(met);
        assert!((score - 0.7).abs() < 1e-9);

        criteria.set_threshold(0.8);
        assert!(!criteria.evaluate(&snapshot()).0);
    }

    #[test]
    fn test_first_triggered_condition_wins() {
        let mut conditions = TerminationConditions::default();
        conditions.push(TerminationCondition::new("never", |_| false));
        conditions.push(TerminationCondition::new("over_budget", |s| s.max_utilization > 0.3));
        conditions.push(TerminationCondition::new("also", |_| true));

        assert_eq!(conditions.triggered(&snapshot()), Some("over_budget"));
    }

    #[test]
    fn test_input_spec_collects_errors() {
        let spec = InputSpec::new()
            .require("task", InputKind::String)
            .require("priority", InputKind::Number)
            .rule(|v| {
                if v.get("task").and_then(|t| t.as_str()).is_some_and(str::is_empty) {
                    Err("task must not be empty".to_string())
                } else {
                    Ok(())
                }
            });

        assert!(spec.validate(&json!({"task": "review", "priority": 2})).is_ok());

        let errors = spec.validate(&json!({"task": "", "priority": "high"})).unwrap_err();
        assert_eq!(errors.len(), 2);

        let errors = spec.validate(&json!({})).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("missing required input: task")));
    }

    #[test]
    fn test_skill_defaults() {
        let skills = SkillSet::new().with_skill("search", 2.5, 0.9);
        assert!(skills.has("search"));
        assert_eq!(skills.cost("search"), 2.5);
        assert_eq!(skills.cost("unknown"), 1.0);
        assert_eq!(skills.success_probability("unknown"), 1.0);
    }

    #[test]
    fn test_output_quality_threshold() {
        let spec = OutputSpec::default();
        assert!(spec.meets_quality(0.8));
        assert!(!spec.meets_quality(0.79));
    }
}
