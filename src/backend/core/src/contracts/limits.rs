//! Contract modes, budget maps and presets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{ContractBuilder, ResourceDimension};
use crate::error::{CovenantError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Contract Mode
// ═══════════════════════════════════════════════════════════════════════════════

/// Execution mode of a contract. Each mode supplies default budgets and a
/// default duration; explicit budgets always win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    /// Speed over cost
    Urgent,
    /// Cost over speed
    Economical,
    /// Between the two
    #[default]
    Balanced,
}

impl ContractMode {
    pub const ALL: [ContractMode; 3] = [Self::Urgent, Self::Economical, Self::Balanced];

    /// Fixed defaults for this mode.
    pub const fn defaults(self) -> ModeDefaults {
        match self {
            Self::Urgent => ModeDefaults {
                duration: Duration::from_secs(30),
                token_budget: 50_000.0,
                iteration_budget: 3.0,
            },
            Self::Economical => ModeDefaults {
                duration: Duration::from_secs(60),
                token_budget: 75_000.0,
                iteration_budget: 6.0,
            },
            Self::Balanced => ModeDefaults {
                duration: Duration::from_secs(90),
                token_budget: 100_000.0,
                iteration_budget: 10.0,
            },
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Economical => "economical",
            Self::Balanced => "balanced",
        }
    }
}

impl fmt::Display for ContractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractMode {
    type Err = CovenantError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "economical" => Ok(Self::Economical),
            "balanced" => Ok(Self::Balanced),
            other => Err(CovenantError::new(
                ErrorCode::InvalidConfiguration,
                format!("Unknown contract mode: {}", other),
            )),
        }
    }
}

/// The `(duration, token budget, iteration budget)` triple a mode supplies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeDefaults {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub token_budget: f64,
    pub iteration_budget: f64,
}

impl ModeDefaults {
    /// The budgets these defaults imply.
    pub fn budgets(&self) -> ResourceBudgets {
        ResourceBudgets::new()
            .with(ResourceDimension::Tokens, self.token_budget)
            .with(ResourceDimension::Iterations, self.iteration_budget)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource Budgets
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-dimension budget map. Absent dimensions are unbounded.
///
/// Infinite values are never stored, so the serialized form only lists finite
/// budgets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceBudgets(BTreeMap<ResourceDimension, f64>);

impl ResourceBudgets {
    /// An empty map: every dimension unbounded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Budget for `dimension`, `f64::INFINITY` when unset.
    pub fn get(&self, dimension: ResourceDimension) -> f64 {
        self.0.get(&dimension).copied().unwrap_or(f64::INFINITY)
    }

    /// Whether `dimension` has a finite budget.
    pub fn is_bounded(&self, dimension: ResourceDimension) -> bool {
        self.0.contains_key(&dimension)
    }

    /// Set a budget. An infinite value clears the dimension.
    pub fn set(&mut self, dimension: ResourceDimension, value: f64) {
        if value == f64::INFINITY {
            self.0.remove(&dimension);
        } else {
            self.0.insert(dimension, value);
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, dimension: ResourceDimension, value: f64) -> Self {
        self.set(dimension, value);
        self
    }

    /// Overlay `other` on top of `self`; entries in `other` win.
    pub fn merged(mut self, other: &ResourceBudgets) -> Self {
        for (dim, value) in other.iter() {
            self.set(dim, value);
        }
        self
    }

    /// Iterate finite budgets in dimension order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceDimension, f64)> + '_ {
        self.0.iter().map(|(d, v)| (*d, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject negative or NaN budgets.
    pub fn validate(&self) -> Result<()> {
        for (dim, value) in self.iter() {
            if value.is_nan() || value < 0.0 {
                return Err(CovenantError::invalid_budget(dim, value));
            }
        }
        Ok(())
    }

    /// First dimension where `self` exceeds a finite budget in `parent`.
    ///
    /// A dimension unbounded in `self` but bounded in `parent` counts as
    /// exceeding it.
    pub fn first_excess(&self, parent: &ResourceBudgets) -> Option<(ResourceDimension, f64, f64)> {
        parent.iter().find_map(|(dim, parent_budget)| {
            let child = self.get(dim);
            (child > parent_budget).then_some((dim, parent_budget, child))
        })
    }

    /// Whether every dimension fits inside `parent`.
    pub fn fits_within(&self, parent: &ResourceBudgets) -> bool {
        self.first_excess(parent).is_none()
    }
}

impl FromIterator<(ResourceDimension, f64)> for ResourceBudgets {
    fn from_iter<I: IntoIterator<Item = (ResourceDimension, f64)>>(iter: I) -> Self {
        let mut budgets = Self::new();
        for (dim, value) in iter {
            budgets.set(dim, value);
        }
        budgets
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════════════════════════

/// Pre-configured contracts for common workloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "preset", rename_all = "snake_case")]
pub enum ContractPreset {
    /// Plain mode defaults
    Default { mode: ContractMode },
    /// Balanced contract with a tight iteration and token budget
    CodeReview { max_iterations: u32, token_budget: u64 },
    /// Economical contract bounding web searches and wall-clock time
    ResearchPipeline {
        web_search_limit: u32,
        #[serde(with = "humantime_serde")]
        time_limit: Duration,
    },
    /// Urgent contract with a short window
    RapidPrototype {
        #[serde(with = "humantime_serde")]
        time_limit: Duration,
    },
}

impl ContractPreset {
    pub fn code_review() -> Self {
        Self::CodeReview {
            max_iterations: 5,
            token_budget: 50_000,
        }
    }

    pub fn research_pipeline() -> Self {
        Self::ResearchPipeline {
            web_search_limit: 10,
            time_limit: Duration::from_secs(300),
        }
    }

    pub fn rapid_prototype() -> Self {
        Self::RapidPrototype {
            time_limit: Duration::from_secs(30),
        }
    }

    /// A builder pre-loaded with this preset's settings.
    pub fn builder(self) -> ContractBuilder {
        match self {
            Self::Default { mode } => ContractBuilder::new(mode),
            Self::CodeReview {
                max_iterations,
                token_budget,
            } => ContractBuilder::new(ContractMode::Balanced)
                .budget(ResourceDimension::Iterations, f64::from(max_iterations))
                .budget(ResourceDimension::Tokens, token_budget as f64),
            Self::ResearchPipeline {
                web_search_limit,
                time_limit,
            } => ContractBuilder::new(ContractMode::Economical)
                .budget(ResourceDimension::WebSearches, f64::from(web_search_limit))
                .duration(time_limit),
            Self::RapidPrototype { time_limit } => {
                ContractBuilder::new(ContractMode::Urgent).duration(time_limit)
            }
        }
    }
}

impl Default for ContractPreset {
    fn default() -> Self {
        Self::Default {
            mode: ContractMode::Balanced,
        }
    }
}
