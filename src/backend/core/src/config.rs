//! Configuration management.
//!
//! Every field has a default, so an empty environment yields a working
//! configuration. Environment variables use the `COVENANT` prefix with `__`
//! between levels:
//!
//! ```text
//! COVENANT__CONSERVATION__RESERVE_BUFFER=0.2
//! COVENANT__SCHEDULER__MAX_WORKERS=8
//! COVENANT__SCHEDULER__ITEM_TIMEOUT=2m
//! COVENANT__TELEMETRY__LOGGING__FORMAT=pretty
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contracts::{ContractBuilder, ContractMode, EnforcementConfig, ModeDefaults};
use crate::error::{CovenantError, ErrorCode, ErrorContext, Result};
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "COVENANT";
const ENV_SEPARATOR: &str = "__";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Child allocation and auditing
    #[serde(default)]
    pub conservation: EnforcementConfig,

    /// Batch scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Replacement mode defaults
    #[serde(default)]
    pub modes: ModeOverrides,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GovernanceConfig {
    /// Load from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: GovernanceConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a TOML, YAML or JSON file, with the environment on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::metadata(path)
            .with_error_code(ErrorCode::MissingConfiguration)
            .map_err(|e| e.with_context("path", path.display().to_string()))?;

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(environment())
            .build()?;

        let cfg: GovernanceConfig = config.try_deserialize()?;
        cfg.validate()?;

        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(cfg)
    }

    /// Reject out-of-range thresholds, buffers and mode defaults.
    pub fn validate(&self) -> Result<()> {
        self.conservation.validate()?;
        self.scheduler.validate()?;
        self.modes.validate()?;
        self.telemetry
            .logging
            .env_filter()
            .map_err(|e| {
                CovenantError::with_internal(
                    ErrorCode::InvalidConfiguration,
                    "Invalid log level directive",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    /// Mode defaults after overrides.
    pub fn mode_defaults(&self, mode: ContractMode) -> ModeDefaults {
        self.modes.defaults_for(mode)
    }

    /// A builder seeded with the configured defaults of `mode`.
    pub fn contract_builder(&self, mode: ContractMode) -> ContractBuilder {
        ContractBuilder::with_defaults(mode, self.mode_defaults(mode))
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Per-mode replacements for the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgent: Option<ModeDefaults>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub economical: Option<ModeDefaults>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balanced: Option<ModeDefaults>,
}

impl ModeOverrides {
    pub fn get(&self, mode: ContractMode) -> Option<&ModeDefaults> {
        match mode {
            ContractMode::Urgent => self.urgent.as_ref(),
            ContractMode::Economical => self.economical.as_ref(),
            ContractMode::Balanced => self.balanced.as_ref(),
        }
    }

    pub fn defaults_for(&self, mode: ContractMode) -> ModeDefaults {
        self.get(mode).copied().unwrap_or_else(|| mode.defaults())
    }

    pub fn validate(&self) -> Result<()> {
        for mode in ContractMode::ALL {
            let Some(defaults) = self.get(mode) else {
                continue;
            };
            if defaults.duration.is_zero() {
                return Err(CovenantError::new(
                    ErrorCode::InvalidConfiguration,
                    format!("modes.{}.duration must be non-zero", mode),
                ));
            }
            defaults.budgets().validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = GovernanceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conservation.reserve_buffer, 0.15);
        assert_eq!(config.scheduler.max_batch_size, 3);
    }

    #[test]
    fn test_mode_override() {
        let mut config = GovernanceConfig::default();
        config.modes.urgent = Some(ModeDefaults {
            duration: Duration::from_secs(10),
            token_budget: 1_000.0,
            iteration_budget: 2.0,
        });

        assert_eq!(config.mode_defaults(ContractMode::Urgent).token_budget, 1_000.0);
        assert_eq!(
            config.mode_defaults(ContractMode::Balanced),
            ContractMode::Balanced.defaults()
        );

        let contract = config.contract_builder(ContractMode::Urgent).build().unwrap();
        assert_eq!(contract.budget(crate::contracts::ResourceDimension::Tokens), 1_000.0);
    }

    #[test]
    fn test_invalid_mode_override_rejected() {
        let mut config = GovernanceConfig::default();
        config.modes.balanced = Some(ModeDefaults {
            duration: Duration::ZERO,
            token_budget: 10.0,
            iteration_budget: 1.0,
        });
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::InvalidConfiguration
        );
    }

    #[test]
    fn test_invalid_reserve_buffer_rejected() {
        let mut config = GovernanceConfig::default();
        config.conservation.reserve_buffer = 1.5;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidThreshold);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: GovernanceConfig = serde_json::from_str(
            r#"{"scheduler":{"max_workers":6,"item_timeout":"45s"},"conservation":{"strategy":"proportional"}}"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_workers, 6);
        assert_eq!(config.scheduler.item_timeout, Duration::from_secs(45));
        assert_eq!(config.scheduler.high_utilization_threshold, 0.8);
        assert_eq!(config.conservation.reserve_buffer, 0.15);
    }
}
