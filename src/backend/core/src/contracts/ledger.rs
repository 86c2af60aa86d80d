//! Resource Ledger - per-dimension budgets and lock-free consumption counters.
//!
//! The `ResourceLedger` provides:
//! - Budgets fixed before activation and sealed afterwards
//! - Compare-and-commit consumption over `f64` bit patterns
//! - A *committed* counter per dimension that gates both the owner's own
//!   consumption and consumption delegated from child contracts
//!
//! Every dimension keeps three counters:
//!
//! | counter     | meaning                                          |
//! |-------------|--------------------------------------------------|
//! | `consumed`  | spent directly by the owning contract            |
//! | `delegated` | spent by descendants and charged through here    |
//! | `committed` | `consumed + delegated`, the only value gated     |
//!
//! `committed` is updated first by a single CAS that checks the budget, so
//! `consumed + delegated` can never exceed the budget, no matter how many
//! callers race.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;

use super::{ResourceBudgets, ResourceDimension};
use crate::error::{CovenantError, Result};

/// Per-dimension amounts (consumption, delegation).
pub type ResourceAmounts = std::collections::BTreeMap<ResourceDimension, f64>;

/// Why the ledger refused a charge.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LedgerRejection {
    /// Amount was negative, NaN or infinite.
    #[error("invalid amount {amount}")]
    InvalidAmount { amount: f64 },

    /// The charge would exceed the budget.
    #[error("requested {requested} but only {remaining} remaining")]
    Exhausted { requested: f64, remaining: f64 },
}

impl LedgerRejection {
    /// Convert into a [`CovenantError`] for `dimension`.
    pub fn into_error(self, dimension: ResourceDimension) -> CovenantError {
        match self {
            Self::InvalidAmount { amount } => CovenantError::invalid_amount(dimension, amount),
            Self::Exhausted {
                requested,
                remaining,
            } => CovenantError::resource_exhausted(dimension, requested, remaining),
        }
    }
}

#[inline]
fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

#[inline]
fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Release);
}

/// Add `amount` to `cell` iff the result stays within `limit`.
///
/// Returns the new value, or the value observed when the charge was refused.
fn cas_add_within(cell: &AtomicU64, amount: f64, limit: f64) -> std::result::Result<f64, f64> {
    let mut current_bits = cell.load(Ordering::Acquire);
    loop {
        let current = f64::from_bits(current_bits);
        let next = current + amount;
        if next > limit {
            return Err(current);
        }
        match cell.compare_exchange_weak(
            current_bits,
            next.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(next),
            Err(actual) => current_bits = actual,
        }
    }
}

/// Subtract `amount` from `cell`, flooring at zero.
fn cas_sub(cell: &AtomicU64, amount: f64) {
    let mut current_bits = cell.load(Ordering::Acquire);
    loop {
        let next = (f64::from_bits(current_bits) - amount).max(0.0);
        match cell.compare_exchange_weak(
            current_bits,
            next.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(actual) => current_bits = actual,
        }
    }
}

/// Unconditional add, used for the reporting counters that trail `committed`.
fn cas_add(cell: &AtomicU64, amount: f64) {
    let _ = cas_add_within(cell, amount, f64::INFINITY);
}

fn validate_amount(amount: f64) -> std::result::Result<(), LedgerRejection> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(LedgerRejection::InvalidAmount { amount })
    }
}

/// Budget and consumption record for one contract.
///
/// All operations take `&self`; the hot path never blocks.
pub struct ResourceLedger {
    budgets: [AtomicU64; ResourceDimension::COUNT],
    consumed: [AtomicU64; ResourceDimension::COUNT],
    delegated: [AtomicU64; ResourceDimension::COUNT],
    committed: [AtomicU64; ResourceDimension::COUNT],
    sealed: AtomicBool,
}

impl ResourceLedger {
    /// A ledger with every dimension unbounded.
    pub fn new() -> Self {
        Self {
            budgets: std::array::from_fn(|_| AtomicU64::new(f64::INFINITY.to_bits())),
            consumed: std::array::from_fn(|_| AtomicU64::new(0)),
            delegated: std::array::from_fn(|_| AtomicU64::new(0)),
            committed: std::array::from_fn(|_| AtomicU64::new(0)),
            sealed: AtomicBool::new(false),
        }
    }

    /// A ledger pre-loaded with `budgets`.
    pub fn with_budgets(budgets: &ResourceBudgets) -> Result<Self> {
        let ledger = Self::new();
        for (dim, value) in budgets.iter() {
            ledger.set_budget(dim, value)?;
        }
        Ok(ledger)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Budgets
    // ─────────────────────────────────────────────────────────────────────────

    /// Budget for `dimension` (`f64::INFINITY` if unset).
    #[inline]
    pub fn budget(&self, dimension: ResourceDimension) -> f64 {
        load_f64(&self.budgets[dimension.index()])
    }

    /// Set a budget. Fails once the ledger is sealed, or for negative/NaN values.
    pub fn set_budget(&self, dimension: ResourceDimension, value: f64) -> Result<()> {
        if self.is_sealed() {
            return Err(CovenantError::ledger_sealed(dimension));
        }
        if value.is_nan() || value < 0.0 {
            return Err(CovenantError::invalid_budget(dimension, value));
        }
        store_f64(&self.budgets[dimension.index()], value);
        Ok(())
    }

    /// Freeze the budgets. Called when the owning contract activates.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Snapshot of all finite budgets.
    pub fn budgets(&self) -> ResourceBudgets {
        ResourceDimension::ALL
            .into_iter()
            .map(|dim| (dim, self.budget(dim)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consumption
    // ─────────────────────────────────────────────────────────────────────────

    /// Charge the owner's own consumption.
    ///
    /// Succeeds iff `consumed + delegated + amount <= budget`; the charge is
    /// either committed whole or not at all. Returns the owner's new consumed
    /// total.
    pub fn consume(
        &self,
        dimension: ResourceDimension,
        amount: f64,
    ) -> std::result::Result<f64, LedgerRejection> {
        self.commit(dimension, amount)?;
        let i = dimension.index();
        cas_add(&self.consumed[i], amount);
        Ok(load_f64(&self.consumed[i]))
    }

    /// Charge consumption made by a descendant contract.
    pub fn delegate(
        &self,
        dimension: ResourceDimension,
        amount: f64,
    ) -> std::result::Result<f64, LedgerRejection> {
        self.commit(dimension, amount)?;
        let i = dimension.index();
        cas_add(&self.delegated[i], amount);
        Ok(load_f64(&self.delegated[i]))
    }

    fn commit(
        &self,
        dimension: ResourceDimension,
        amount: f64,
    ) -> std::result::Result<f64, LedgerRejection> {
        validate_amount(amount)?;
        let budget = self.budget(dimension);
        cas_add_within(&self.committed[dimension.index()], amount, budget).map_err(|current| {
            LedgerRejection::Exhausted {
                requested: amount,
                remaining: (budget - current).max(0.0),
            }
        })
    }

    /// Roll back a previous [`consume`](Self::consume).
    pub fn refund(&self, dimension: ResourceDimension, amount: f64) {
        let i = dimension.index();
        cas_sub(&self.consumed[i], amount);
        cas_sub(&self.committed[i], amount);
    }

    /// Roll back a previous [`delegate`](Self::delegate).
    pub fn refund_delegated(&self, dimension: ResourceDimension, amount: f64) {
        let i = dimension.index();
        cas_sub(&self.delegated[i], amount);
        cas_sub(&self.committed[i], amount);
    }

    /// Amount the owner consumed directly.
    #[inline]
    pub fn consumed(&self, dimension: ResourceDimension) -> f64 {
        load_f64(&self.consumed[dimension.index()])
    }

    /// Amount descendants consumed through this ledger.
    #[inline]
    pub fn delegated(&self, dimension: ResourceDimension) -> f64 {
        load_f64(&self.delegated[dimension.index()])
    }

    /// Everything charged against the budget, own plus delegated.
    #[inline]
    pub fn committed(&self, dimension: ResourceDimension) -> f64 {
        load_f64(&self.committed[dimension.index()])
    }

    /// Budget left for further charges (`f64::INFINITY` if unbounded).
    pub fn remaining(&self, dimension: ResourceDimension) -> f64 {
        (self.budget(dimension) - self.committed(dimension)).max(0.0)
    }

    /// Own consumption of every dimension.
    pub fn consumption(&self) -> ResourceAmounts {
        ResourceDimension::ALL
            .into_iter()
            .map(|dim| (dim, self.consumed(dim)))
            .collect()
    }

    /// Delegated consumption of every dimension.
    pub fn delegation(&self) -> ResourceAmounts {
        ResourceDimension::ALL
            .into_iter()
            .map(|dim| (dim, self.delegated(dim)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Utilization
    // ─────────────────────────────────────────────────────────────────────────

    /// `consumed / budget`, or 0 for an unbounded dimension.
    pub fn utilization(&self, dimension: ResourceDimension) -> f64 {
        ratio(self.consumed(dimension), self.budget(dimension))
    }

    /// `(consumed + delegated) / budget`, or 0 for an unbounded dimension.
    pub fn aggregate_utilization(&self, dimension: ResourceDimension) -> f64 {
        ratio(self.committed(dimension), self.budget(dimension))
    }

    /// Highest own utilization across finite-budget dimensions.
    pub fn max_utilization(&self) -> f64 {
        ResourceDimension::ALL
            .into_iter()
            .map(|dim| self.utilization(dim))
            .fold(0.0, f64::max)
    }

    /// Highest aggregate utilization across finite-budget dimensions.
    pub fn aggregate_max_utilization(&self) -> f64 {
        ResourceDimension::ALL
            .into_iter()
            .map(|dim| self.aggregate_utilization(dim))
            .fold(0.0, f64::max)
    }

    /// First finite dimension whose committed total reached its budget.
    ///
    /// A zero budget counts as exhausted.
    pub fn exhausted_dimension(&self) -> Option<ResourceDimension> {
        ResourceDimension::ALL.into_iter().find(|dim| {
            let budget = self.budget(*dim);
            budget.is_finite() && self.committed(*dim) >= budget
        })
    }
}

fn ratio(used: f64, budget: f64) -> f64 {
    if !budget.is_finite() {
        0.0
    } else if budget <= 0.0 {
        if used > 0.0 {
            f64::INFINITY
        } else {
            1.0
        }
    } else {
        used / budget
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("budgets", &self.budgets())
            .field("consumed", &self.consumption())
            .field("delegated", &self.delegation())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use ResourceDimension::*;

    fn test_ledger() -> ResourceLedger {
        ResourceLedger::with_budgets(
            &ResourceBudgets::new().with(Tokens, 100.0).with(Iterations, 3.0),
        )
        .unwrap()
    }

    #[test]
    fn test_unset_budget_is_infinite() {
        let ledger = ResourceLedger::new();
        assert!(ledger.budget(ApiCalls).is_infinite());
        assert!(ledger.consume(ApiCalls, 1e12).is_ok());
        assert_eq!(ledger.utilization(ApiCalls), 0.0);
        assert_eq!(ledger.max_utilization(), 0.0);
    }

    #[test]
    fn test_exact_boundary() {
        let ledger = test_ledger();
        assert_eq!(ledger.consume(Tokens, 60.0), Ok(60.0));
        assert_eq!(ledger.consume(Tokens, 40.0), Ok(100.0));
        assert!(matches!(
            ledger.consume(Tokens, 1e-6),
            Err(LedgerRejection::Exhausted { .. })
        ));
        assert_eq!(ledger.consumed(Tokens), 100.0);
    }

    #[test]
    fn test_rejection_is_not_clamped() {
        let ledger = test_ledger();
        ledger.consume(Tokens, 90.0).unwrap();
        let rejection = ledger.consume(Tokens, 20.0).unwrap_err();
        assert_eq!(
            rejection,
            LedgerRejection::Exhausted {
                requested: 20.0,
                remaining: 10.0
            }
        );
        assert_eq!(ledger.consumed(Tokens), 90.0);
    }

    #[test]
    fn test_invalid_amounts() {
        let ledger = test_ledger();
        for amount in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ledger.consume(Tokens, amount),
                Err(LedgerRejection::InvalidAmount { .. })
            ));
        }
        assert_eq!(ledger.consumed(Tokens), 0.0);
    }

    #[test]
    fn test_sealed_ledger_refuses_budget_changes() {
        let ledger = test_ledger();
        ledger.seal();
        assert!(ledger.set_budget(Tokens, 1_000.0).is_err());
        assert_eq!(ledger.budget(Tokens), 100.0);
    }

    #[test]
    fn test_delegated_shares_budget_with_own_consumption() {
        let ledger = test_ledger();
        ledger.delegate(Tokens, 70.0).unwrap();
        assert!(ledger.consume(Tokens, 40.0).is_err());
        assert!(ledger.consume(Tokens, 30.0).is_ok());
        assert_eq!(ledger.utilization(Tokens), 0.3);
        assert_eq!(ledger.aggregate_utilization(Tokens), 1.0);
        assert_eq!(ledger.exhausted_dimension(), Some(Tokens));
    }

    #[test]
    fn test_refund_restores_capacity() {
        let ledger = test_ledger();
        ledger.delegate(Tokens, 80.0).unwrap();
        ledger.refund_delegated(Tokens, 80.0);
        assert_eq!(ledger.delegated(Tokens), 0.0);
        assert!(ledger.consume(Tokens, 100.0).is_ok());
        ledger.refund(Tokens, 100.0);
        assert_eq!(ledger.remaining(Tokens), 100.0);
    }

    #[test]
    fn test_max_utilization_ignores_unbounded() {
        let ledger = test_ledger();
        ledger.consume(Tokens, 25.0).unwrap();
        ledger.consume(Iterations, 2.0).unwrap();
        ledger.consume(WebSearches, 500.0).unwrap();
        let max = ledger.max_utilization();
        assert!((max - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_consumers_never_overshoot() {
        let ledger = Arc::new(test_ledger());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let mut accepted = 0.0;
                    for _ in 0..100 {
                        if ledger.consume(Tokens, 0.5).is_ok() {
                            accepted += 0.5;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let accepted: f64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 100.0);
        assert_eq!(ledger.consumed(Tokens), 100.0);
    }
}
