#![allow(clippy::result_large_err)]
//! # Covenant Core
//!
//! Resource-contract governance for autonomous work.
//!
//! ## Architecture
//!
//! - **Contracts**: Budgeted, time-limited grants with a one-way lifecycle
//! - **Ledger**: Lock-free per-dimension accounting, including what children
//!   spent on a parent's behalf
//! - **Conservation**: Child allocation that never lets children outspend
//!   their root
//! - **Scheduler**: Utilization-sized batches, one child contract per item
//! - **Telemetry**: Structured logging and Prometheus metrics
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covenant_core::prelude::*;
//!
//! # fn main() -> covenant_core::Result<()> {
//! let root = Arc::new(Contract::new(ContractMode::Balanced)?);
//! root.activate()?;
//!
//! let enforcer = ConservationEnforcer::new(Arc::clone(&root));
//! let child = enforcer.create_child_contract(ContractMode::Balanced)?;
//! enforcer.activate_child(&child)?;
//!
//! assert!(child.consume(ResourceDimension::Tokens, 1_000.0));
//! assert!(enforcer.verify_conservation());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contracts;
pub mod error;
pub mod scheduler;
pub mod telemetry;

pub use error::{CovenantError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{GovernanceConfig, ModeOverrides};
    pub use crate::contracts::{
        AllocationStrategy, ConservationEnforcer, ConservationReport, Contract, ContractBuilder,
        ContractMode, ContractPreset, ContractState, ContractStatus, EnforcementConfig,
        ProceedCheck, ResourceBudgets, ResourceDimension, ResourceLedger, TemporalWindow,
        ThresholdLevel,
    };
    pub use crate::error::{CovenantError, ErrorCode, ErrorContext, Result};
    pub use crate::scheduler::{
        AgentRankings, AgentSelector, BatchScheduler, CostModel, ExecutionStats, FixedAgent,
        ItemResult, OutputSizeCostModel, ResourceAwareSelector, SchedulerConfig, WorkContext,
        WorkItem, WorkItemExecutor, WorkOutput,
    };
    pub use crate::telemetry::{init_telemetry, TelemetryConfig};
}
