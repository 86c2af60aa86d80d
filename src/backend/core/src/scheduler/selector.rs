//! Agent selection.
//!
//! The scheduler asks an [`AgentSelector`] for an agent name per item. Names
//! are opaque strings handed through to the [`WorkItemExecutor`].
//!
//! [`WorkItemExecutor`]: super::WorkItemExecutor

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::WorkItem;
use crate::contracts::{Contract, ContractMode};

/// Picks the agent that runs a work item.
pub trait AgentSelector: Send + Sync {
    /// `root` is the scheduler's root contract, if any.
    fn select(&self, item: &WorkItem, root: Option<&Contract>) -> String;
}

/// Always the same agent.
#[derive(Debug, Clone)]
pub struct FixedAgent(pub String);

impl FixedAgent {
    pub fn new(agent: impl Into<String>) -> Self {
        Self(agent.into())
    }
}

impl AgentSelector for FixedAgent {
    fn select(&self, _item: &WorkItem, _root: Option<&Contract>) -> String {
        self.0.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource-Aware Selection
// ═══════════════════════════════════════════════════════════════════════════════

/// Preference orders, best first. Agents missing from a ranking are only
/// picked as a last resort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRankings {
    #[serde(default)]
    pub speed: Vec<String>,
    #[serde(default)]
    pub efficiency: Vec<String>,
    #[serde(default)]
    pub cost: Vec<String>,
    #[serde(default)]
    pub quality: Vec<String>,
}

/// Why an agent was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Urgent,
    TimeConstraint,
    ResourceConstraint,
    Balanced,
    Quality,
    Default,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::TimeConstraint => "time_constraint",
            Self::ResourceConstraint => "resource_constraint",
            Self::Balanced => "balanced",
            Self::Quality => "quality",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub item_id: String,
    pub agent: String,
    pub reason: SelectionReason,
    pub max_utilization: f64,
}

/// Per-agent selection counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSelectionStats {
    pub count: usize,
    pub by_reason: BTreeMap<SelectionReason, usize>,
}

/// Chooses by the root contract's pressure.
///
/// Urgent mode or under 30 s left: speed. Above 80% utilization: efficiency.
/// Above 50%: cost. Below 50%: quality. At exactly 50%: the first available
/// agent.
pub struct ResourceAwareSelector {
    available: Vec<String>,
    rankings: AgentRankings,
    fallback: String,
    history: Mutex<Vec<Selection>>,
}

const LOW_TIME: Duration = Duration::from_secs(30);
const HIGH_UTILIZATION: f64 = 0.8;
const MEDIUM_UTILIZATION: f64 = 0.5;

impl ResourceAwareSelector {
    pub fn new(available: Vec<String>, rankings: AgentRankings) -> Self {
        Self {
            available,
            rankings,
            fallback: "default".to_string(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Agent used when nothing is available.
    pub fn with_fallback(mut self, agent: impl Into<String>) -> Self {
        self.fallback = agent.into();
        self
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    /// Decide without recording.
    pub fn choose(&self, root: Option<&Contract>) -> (String, SelectionReason) {
        let (urgent, time_remaining, max_util) = match root {
            Some(contract) => (
                contract.mode() == ContractMode::Urgent,
                contract.time_remaining(),
                contract.aggregate_max_utilization(),
            ),
            None => (false, Duration::MAX, 0.0),
        };

        let (ranking, reason) = if urgent {
            (Some(&self.rankings.speed), SelectionReason::Urgent)
        } else if time_remaining < LOW_TIME {
            (Some(&self.rankings.speed), SelectionReason::TimeConstraint)
        } else if max_util > HIGH_UTILIZATION {
            (Some(&self.rankings.efficiency), SelectionReason::ResourceConstraint)
        } else if max_util > MEDIUM_UTILIZATION {
            (Some(&self.rankings.cost), SelectionReason::Balanced)
        } else if max_util < MEDIUM_UTILIZATION {
            (Some(&self.rankings.quality), SelectionReason::Quality)
        } else {
            (None, SelectionReason::Default)
        };

        let agent = ranking
            .and_then(|order| order.iter().find(|a| self.available.contains(a)))
            .or_else(|| self.available.first())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        (agent, reason)
    }

    pub fn history(&self) -> Vec<Selection> {
        self.history.lock().clone()
    }

    pub fn selection_stats(&self) -> BTreeMap<String, AgentSelectionStats> {
        let mut stats: BTreeMap<String, AgentSelectionStats> = BTreeMap::new();
        for selection in self.history.lock().iter() {
            let entry = stats.entry(selection.agent.clone()).or_default();
            entry.count += 1;
            *entry.by_reason.entry(selection.reason).or_insert(0) += 1;
        }
        stats
    }
}

impl AgentSelector for ResourceAwareSelector {
    fn select(&self, item: &WorkItem, root: Option<&Contract>) -> String {
        let (agent, reason) = self.choose(root);
        let max_utilization = root.map(|c| c.aggregate_max_utilization()).unwrap_or(0.0);

        tracing::debug!(
            item_id = %item.id,
            agent = %agent,
            reason = %reason,
            max_utilization = max_utilization,
            "Agent selected"
        );

        self.history.lock().push(Selection {
            item_id: item.id.clone(),
            agent: agent.clone(),
            reason,
            max_utilization,
        });
        agent
    }
}

impl fmt::Debug for ResourceAwareSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAwareSelector")
            .field("available", &self.available)
            .field("rankings", &self.rankings)
            .field("selections", &self.history.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ContractBuilder, ResourceDimension};

    fn rankings() -> AgentRankings {
        AgentRankings {
            speed: vec!["swift".into(), "careful".into()],
            efficiency: vec!["lean".into(), "swift".into()],
            cost: vec!["thrifty".into(), "lean".into()],
            quality: vec!["careful".into(), "lean".into()],
        }
    }

    fn selector() -> ResourceAwareSelector {
        ResourceAwareSelector::new(
            vec!["lean".into(), "careful".into(), "swift".into(), "thrifty".into()],
            rankings(),
        )
    }

    fn root_at(mode: ContractMode, tokens_used: f64) -> Contract {
        let contract = ContractBuilder::new(mode)
            .budget(ResourceDimension::Tokens, 100.0)
            .build()
            .unwrap();
        contract.activate().unwrap();
        if tokens_used > 0.0 {
            assert!(contract.consume(ResourceDimension::Tokens, tokens_used));
        }
        contract
    }

    #[test]
    fn test_no_contract_prefers_quality() {
        let (agent, reason) = selector().choose(None);
        assert_eq!(agent, "careful");
        assert_eq!(reason, SelectionReason::Quality);
    }

    #[test]
    fn test_utilization_tiers() {
        let s = selector();

        let root = root_at(ContractMode::Balanced, 85.0);
        assert_eq!(s.choose(Some(&root)), ("lean".to_string(), SelectionReason::ResourceConstraint));

        let root = root_at(ContractMode::Balanced, 60.0);
        assert_eq!(s.choose(Some(&root)), ("thrifty".to_string(), SelectionReason::Balanced));

        let root = root_at(ContractMode::Balanced, 50.0);
        assert_eq!(s.choose(Some(&root)), ("lean".to_string(), SelectionReason::Default));
    }

    #[test]
    fn test_urgent_prefers_speed() {
        let root = root_at(ContractMode::Urgent, 0.0);
        let (agent, reason) = selector().choose(Some(&root));
        assert_eq!(agent, "swift");
        assert_eq!(reason, SelectionReason::Urgent);
    }

    #[test]
    fn test_unranked_falls_back_to_first_available() {
        let s = ResourceAwareSelector::new(vec!["solo".into()], rankings());
        assert_eq!(s.choose(None).0, "solo");

        let empty = ResourceAwareSelector::new(Vec::new(), rankings()).with_fallback("noop");
        assert_eq!(empty.choose(None).0, "noop");
    }

    #[test]
    fn test_selections_are_recorded() {
        let s = selector();
        let item = WorkItem::new("1", "demo");
        s.select(&item, None);
        s.select(&item, None);

        let stats = s.selection_stats();
        assert_eq!(stats["careful"].count, 2);
        assert_eq!(stats["careful"].by_reason[&SelectionReason::Quality], 2);
        assert_eq!(s.history().len(), 2);
    }

    #[test]
    fn test_fixed_agent() {
        let item = WorkItem::new("1", "demo");
        assert_eq!(FixedAgent::new("only").select(&item, None), "only");
    }
}
