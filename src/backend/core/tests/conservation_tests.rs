//! Conservation law tests.
//!
//! Children spending concurrently against one root must never push the
//! root's combined consumption past its budget, whatever the interleaving.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use covenant_core::contracts::{
    AllocationStrategy, ConservationEnforcer, Contract, ContractBuilder, ContractMode,
    ContractState, EnforcementConfig, ResourceDimension,
};
use ResourceDimension::*;

fn root_with_tokens(tokens: f64) -> Arc<Contract> {
    let root = Arc::new(
        ContractBuilder::new(ContractMode::Balanced)
            .budget(Tokens, tokens)
            .build()
            .unwrap(),
    );
    root.activate().unwrap();
    root
}

fn enforcer(root: &Arc<Contract>, reserve_buffer: f64) -> ConservationEnforcer {
    ConservationEnforcer::with_config(
        EnforcementConfig::default().with_reserve_buffer(reserve_buffer),
        Arc::clone(root),
    )
    .unwrap()
}

fn children_consumed(enforcer: &ConservationEnforcer, dimension: ResourceDimension) -> f64 {
    enforcer.children().iter().map(|c| c.consumed(dimension)).sum()
}

// ============================================================================
// Allocation
// ============================================================================

#[test]
fn test_allocation_sequence_without_reserve() {
    let root = root_with_tokens(100.0);
    let enforcer = enforcer(&root, 0.0);

    let budgets: Vec<f64> = (0..4)
        .map(|_| {
            let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
            child.budget(Tokens)
        })
        .collect();

    assert_eq!(budgets[0], 100.0);
    assert_eq!(budgets[1], 50.0);
    assert!((budgets[2] - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(budgets[3], 25.0);
}

#[test]
fn test_allocation_with_default_reserve() {
    let root = root_with_tokens(1_000.0);
    let enforcer = ConservationEnforcer::new(Arc::clone(&root));

    let first = enforcer
        .allocate_child_budget(AllocationStrategy::Equal, 0.15)
        .unwrap();
    assert!((first.get(Tokens) - 850.0).abs() < 1e-9);

    enforcer.create_child_contract(ContractMode::Balanced).unwrap();
    let second = enforcer
        .allocate_child_budget(AllocationStrategy::Equal, 0.15)
        .unwrap();
    assert!((second.get(Tokens) - 425.0).abs() < 1e-9);
}

// ============================================================================
// Concurrent Spending
// ============================================================================

#[test]
fn test_full_spend_never_exceeds_root() {
    let root = root_with_tokens(100.0);
    let enforcer = enforcer(&root, 0.0);

    let children: Vec<_> = (0..4)
        .map(|_| {
            let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
            enforcer.activate_child(&child).unwrap();
            child
        })
        .collect();

    let handles: Vec<_> = children
        .iter()
        .map(|child| {
            let child = Arc::clone(child);
            thread::spawn(move || child.consume(Tokens, child.budget(Tokens)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = root.consumed(Tokens) + children_consumed(&enforcer, Tokens);
    assert!(total <= 100.0 + 1e-9, "total {} exceeds root budget", total);
    assert!(enforcer.verify_conservation());
    assert!(root.delegated(Tokens) <= 100.0 + 1e-9);
}

#[test]
fn test_refused_child_spend_marks_child_violated() {
    let root = root_with_tokens(100.0);
    let enforcer = enforcer(&root, 0.0);

    let big = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
    let small = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
    enforcer.activate_child(&big).unwrap();
    enforcer.activate_child(&small).unwrap();

    assert!(big.consume(Tokens, 100.0));
    assert!(!small.consume(Tokens, 1.0));

    assert_eq!(small.state(), ContractState::Violated);
    assert_eq!(small.consumed(Tokens), 0.0);
    assert_eq!(root.delegated(Tokens), 100.0);
    assert!(enforcer.verify_conservation());
}

#[test]
fn test_root_spend_shares_budget_with_children() {
    let root = root_with_tokens(100.0);
    let enforcer = enforcer(&root, 0.0);

    let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
    enforcer.activate_child(&child).unwrap();

    assert!(root.consume(Tokens, 60.0));
    assert!(!child.consume(Tokens, 50.0));
    assert!(enforcer.verify_conservation());

    let report = enforcer.conservation_report();
    let tokens = report
        .dimensions
        .iter()
        .find(|d| d.dimension == Tokens)
        .unwrap();
    assert_eq!(tokens.root_consumed, 60.0);
    assert_eq!(tokens.children_consumed, 0.0);
}

#[test]
fn test_child_over_own_budget_never_holds_root_share() {
    let root = root_with_tokens(100.0);
    let child = |budget: f64| {
        let child = Arc::new(
            ContractBuilder::new(ContractMode::Balanced)
                .budget(Tokens, budget)
                .parent(&root)
                .build()
                .unwrap(),
        );
        child.activate().unwrap();
        child
    };

    let steady = child(50.0);
    let greedy: Vec<_> = (0..500).map(|_| child(50.0)).collect();

    let overreach = thread::spawn(move || {
        for contract in greedy {
            assert!(!contract.consume(Tokens, 60.0));
            assert_eq!(contract.state(), ContractState::Violated);
        }
    });
    let spender = {
        let steady = Arc::clone(&steady);
        thread::spawn(move || (0..45).all(|_| steady.consume(Tokens, 1.0)))
    };

    overreach.join().unwrap();
    assert!(spender.join().unwrap());
    assert_eq!(steady.state(), ContractState::Active);
    assert_eq!(steady.consumed(Tokens), 45.0);
    assert_eq!(root.delegated(Tokens), 45.0);
}

#[test]
fn test_ancestor_refusal_rolls_back_own_charge() {
    let root = root_with_tokens(10.0);
    let child = Arc::new(
        ContractBuilder::new(ContractMode::Balanced)
            .budget(Tokens, 10.0)
            .parent(&root)
            .build()
            .unwrap(),
    );
    child.activate().unwrap();
    assert!(root.consume(Tokens, 8.0));

    assert!(!child.consume(Tokens, 5.0));
    assert_eq!(child.consumed(Tokens), 0.0);
    assert_eq!(child.ledger().committed(Tokens), 0.0);
    assert_eq!(root.delegated(Tokens), 0.0);
    assert_eq!(child.state(), ContractState::Violated);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_concurrent_children_conserve_root(
        budget in 10.0f64..1_000.0,
        reserve in 0.0f64..0.5,
        spends in prop::collection::vec(prop::collection::vec(0.1f64..200.0, 1..8), 1..6),
    ) {
        let root = root_with_tokens(budget);
        let enforcer = enforcer(&root, reserve);

        let mut handles = Vec::new();
        for amounts in spends {
            let child = enforcer.create_child_contract(ContractMode::Balanced).unwrap();
            enforcer.activate_child(&child).unwrap();
            handles.push(thread::spawn(move || {
                for amount in amounts {
                    child.consume(Tokens, amount);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let total = root.consumed(Tokens) + children_consumed(&enforcer, Tokens);
        prop_assert!(total <= budget * (1.0 + 1e-9));
        prop_assert!(enforcer.verify_conservation());
        for child in enforcer.children() {
            prop_assert!(child.consumed(Tokens) <= child.budget(Tokens) * (1.0 + 1e-9));
        }
    }
}
