//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use covenant_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let telemetry = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! println!("{}", telemetry.metrics.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, ContractMetrics, MetricsConfig, MetricsRegistry, OperationTimer,
    SchedulerMetrics,
};

use serde::{Deserialize, Serialize};

/// Logging plus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Name attached to metrics as the `service` label
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "covenant".to_string()
}

/// Install metrics first, then the log subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging)?;

    ::tracing::info!(
        service = %config.service_name,
        metrics_enabled = metrics.is_enabled(),
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics })
}

/// Keeps the installed recorder reachable.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "covenant");
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"logging":{"level":"debug"}}"#).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.service_name, "covenant");
    }
}
