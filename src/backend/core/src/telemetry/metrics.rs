//! Prometheus metrics for contracts, consumption and batch scheduling.
//!
//! Everything goes through the `metrics` facade, so recording is a no-op until
//! a recorder is installed with [`init_metrics`].
//!
//! # Example
//!
//! ```rust,no_run
//! use covenant_core::telemetry::metrics::{ContractMetrics, SchedulerMetrics};
//! use covenant_core::contracts::ResourceDimension;
//!
//! ContractMetrics::record_consumption(ResourceDimension::Tokens, 1_250.0);
//! SchedulerMetrics::record_batch(3);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::contracts::{ContractMode, ContractState, ResourceDimension};

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for item durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

/// Handle to the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Whether a Prometheus recorder is installed.
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the bucket list is empty or a global recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Contract metrics
    describe_counter!("covenant_contracts_total", "Contracts constructed, by mode");
    describe_counter!(
        "covenant_contract_transitions_total",
        "Contract state transitions, by target state"
    );
    describe_counter!(
        "covenant_consumption_total",
        "Accepted consumption events, by dimension"
    );
    describe_histogram!(
        "covenant_consumption_amount",
        "Amount charged per accepted consumption event"
    );
    describe_counter!(
        "covenant_consumption_rejected_total",
        "Rejected consumption requests, by dimension"
    );
    describe_counter!(
        "covenant_children_allocated_total",
        "Child contracts created by conservation enforcers"
    );
    describe_gauge!(
        "covenant_root_max_utilization",
        "Aggregate max utilization of the scheduler's root contract (0-1)"
    );

    // Scheduler metrics
    describe_counter!("covenant_batches_total", "Batches dispatched");
    describe_histogram!("covenant_batch_size", "Number of items per dispatched batch");
    describe_counter!("covenant_items_total", "Work items finished, by status");
    describe_histogram!(
        "covenant_item_duration_seconds",
        "Work item execution time in seconds"
    );
    describe_histogram!(
        "covenant_operation_duration_seconds",
        "Duration of timed internal operations"
    );

    // Error metrics
    describe_counter!("covenant_errors_total", "Errors constructed, by code");
}

/// Contract lifecycle and ledger metrics.
pub struct ContractMetrics;

impl ContractMetrics {
    /// Record a newly built contract.
    pub fn record_created(mode: ContractMode) {
        counter!("covenant_contracts_total", "mode" => mode.as_str()).increment(1);
    }

    /// Record a state transition.
    pub fn record_transition(to: ContractState) {
        counter!("covenant_contract_transitions_total", "to" => to.as_str()).increment(1);
    }

    /// Record an accepted consumption event.
    pub fn record_consumption(dimension: ResourceDimension, amount: f64) {
        counter!("covenant_consumption_total", "dimension" => dimension.as_str()).increment(1);
        histogram!("covenant_consumption_amount", "dimension" => dimension.as_str())
            .record(amount);
    }

    /// Record a rejected consumption request.
    pub fn record_rejection(dimension: ResourceDimension) {
        counter!("covenant_consumption_rejected_total", "dimension" => dimension.as_str())
            .increment(1);
    }

    /// Record a child contract allocation.
    pub fn record_child_allocated() {
        counter!("covenant_children_allocated_total").increment(1);
    }

    /// Publish the root contract's aggregate max utilization.
    pub fn set_root_utilization(utilization: f64) {
        gauge!("covenant_root_max_utilization").set(utilization);
    }
}

/// Batch scheduler metrics.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a dispatched batch.
    pub fn record_batch(size: usize) {
        counter!("covenant_batches_total").increment(1);
        histogram!("covenant_batch_size").record(size as f64);
    }

    /// Record a finished work item.
    pub fn record_item(success: bool, duration_seconds: f64) {
        let status = if success { "success" } else { "failure" };
        counter!("covenant_items_total", "status" => status).increment(1);
        histogram!("covenant_item_duration_seconds").record(duration_seconds);
    }
}

/// Utility for tracking operation timing with automatic metric recording.
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    /// Start timing an operation.
    pub fn start(operation_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    /// Get elapsed time without recording.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish and record to `covenant_operation_duration_seconds`.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();

        histogram!(
            "covenant_operation_duration_seconds",
            "operation" => self.operation_name,
        )
        .record(duration.as_secs_f64());

        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = init_metrics(&MetricsConfig::default(), "covenant-test").unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        ContractMetrics::record_created(ContractMode::Balanced);
        ContractMetrics::record_consumption(ResourceDimension::Tokens, 12.0);
        SchedulerMetrics::record_batch(2);
        SchedulerMetrics::record_item(true, 0.25);
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::start("test_operation");

        std::thread::sleep(std::time::Duration::from_millis(10));
        let duration = timer.finish();

        assert!(duration.as_millis() >= 10);
    }
}
