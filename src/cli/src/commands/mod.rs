//! Subcommands.

pub mod allocate;
pub mod config;
pub mod plan;
pub mod simulate;
pub mod status;

use anyhow::{anyhow, Result};

use covenant_core::config::GovernanceConfig;
use covenant_core::contracts::{Contract, ContractMode, ResourceDimension};

/// Parse a `dimension=value` pair.
pub fn parse_amount(s: &str) -> Result<(ResourceDimension, f64)> {
    let (dim, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected DIMENSION=VALUE, got '{}'", s))?;
    let dimension: ResourceDimension = dim.parse()?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid amount '{}' for {}", value, dimension))?;
    Ok((dimension, value))
}

/// Build a root contract for `mode`, applying configured defaults and
/// explicit budget overrides.
pub fn build_root(
    governance: &GovernanceConfig,
    mode: ContractMode,
    budgets: &[(ResourceDimension, f64)],
) -> Result<Contract> {
    let builder = budgets
        .iter()
        .fold(governance.contract_builder(mode), |builder, &(dim, value)| {
            builder.budget(dim, value)
        });
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        let (dim, value) = parse_amount("api-calls=12.5").unwrap();
        assert_eq!(dim, ResourceDimension::ApiCalls);
        assert_eq!(value, 12.5);
    }

    #[test]
    fn test_parse_amount_rejects_malformed() {
        assert!(parse_amount("tokens").is_err());
        assert!(parse_amount("tokens=lots").is_err());
        assert!(parse_amount("gold=5").is_err());
    }

    #[test]
    fn test_build_root_applies_overrides() {
        let root = build_root(
            &GovernanceConfig::default(),
            ContractMode::Urgent,
            &[(ResourceDimension::Tokens, 500.0)],
        )
        .unwrap();
        assert_eq!(root.budget(ResourceDimension::Tokens), 500.0);
        assert_eq!(root.budget(ResourceDimension::Iterations), 3.0);
    }
}
