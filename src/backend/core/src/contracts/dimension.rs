//! Resource dimensions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CovenantError, ErrorCode};

/// A single kind of resource a contract can budget.
///
/// Dimensions are independent: budgets and consumption are never combined or
/// converted between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    /// Language-model token units
    Tokens,
    /// Calls to external APIs
    ApiCalls,
    /// Agent loop iterations
    Iterations,
    /// Web search requests
    WebSearches,
    /// Wall-clock compute time in seconds
    ComputeTime,
    /// Monetary cost in dollars
    ExternalCost,
}

impl ResourceDimension {
    /// Number of dimensions.
    pub const COUNT: usize = 6;

    /// Every dimension, in declaration order.
    pub const ALL: [ResourceDimension; Self::COUNT] = [
        Self::Tokens,
        Self::ApiCalls,
        Self::Iterations,
        Self::WebSearches,
        Self::ComputeTime,
        Self::ExternalCost,
    ];

    /// Stable index used for per-dimension atomic arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Tokens => 0,
            Self::ApiCalls => 1,
            Self::Iterations => 2,
            Self::WebSearches => 3,
            Self::ComputeTime => 4,
            Self::ExternalCost => 5,
        }
    }

    /// The snake_case name used in configuration and serialized output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::ApiCalls => "api_calls",
            Self::Iterations => "iterations",
            Self::WebSearches => "web_searches",
            Self::ComputeTime => "compute_time",
            Self::ExternalCost => "external_cost",
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceDimension {
    type Err = CovenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|dim| dim.as_str() == normalized)
            .ok_or_else(|| {
                CovenantError::new(
                    ErrorCode::InvalidConfiguration,
                    format!("Unknown resource dimension: {}", s),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_declaration_order() {
        for (i, dim) in ResourceDimension::ALL.iter().enumerate() {
            assert_eq!(dim.index(), i);
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("tokens".parse::<ResourceDimension>().unwrap(), ResourceDimension::Tokens);
        assert_eq!(
            "web-searches".parse::<ResourceDimension>().unwrap(),
            ResourceDimension::WebSearches
        );
        assert_eq!(
            " External_Cost ".parse::<ResourceDimension>().unwrap(),
            ResourceDimension::ExternalCost
        );
        assert!("bananas".parse::<ResourceDimension>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ResourceDimension::ApiCalls).unwrap();
        assert_eq!(json, "\"api_calls\"");
    }
}
