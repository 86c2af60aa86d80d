//! Error handling for Covenant Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and structured details
//! - Severity classification driving log levels
//! - Error metrics via the `metrics` facade
//!
//! Budget exhaustion on the hot path is reported as a boolean by
//! [`Contract::consume`](crate::contracts::Contract::consume); the error type
//! carries the reason for callers that want it via `try_consume`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use covenant_core::error::{CovenantError, Result, ErrorContext};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("covenant.toml")
//!         .with_error_code(ErrorCode::MissingConfiguration)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::contracts::{ContractState, ResourceDimension};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Covenant operations.
pub type Result<T> = std::result::Result<T, CovenantError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by the orchestration layer for
/// programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Contract Errors (1100-1199)
    ResourceExhausted,
    ConservationViolation,
    ContractExpired,
    ContractTerminated,
    InvalidStateTransition,
    InvalidAmount,
    InputRejected,

    // Work Item Errors (1300-1399)
    WorkItemFailed,
    WorkItemTimeout,
    WorkItemCancelled,
    PoolAcquireTimeout,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
    InvalidBudget,
    InvalidThreshold,
    LedgerSealed,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Contract Errors
            Self::ResourceExhausted => 1100,
            Self::ConservationViolation => 1101,
            Self::ContractExpired => 1102,
            Self::ContractTerminated => 1103,
            Self::InvalidStateTransition => 1104,
            Self::InvalidAmount => 1105,
            Self::InputRejected => 1106,

            // Work Item Errors
            Self::WorkItemFailed => 1300,
            Self::WorkItemTimeout => 1301,
            Self::WorkItemCancelled => 1302,
            Self::PoolAcquireTimeout => 1303,

            // Serialization Errors
            Self::SerializationError => 2200,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::InvalidBudget => 5003,
            Self::InvalidThreshold => 5004,
            Self::LedgerSealed => 5005,

            // Internal Errors
            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The core never retries on its own; this is advice for the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConservationViolation
                | Self::WorkItemTimeout
                | Self::WorkItemFailed
                | Self::PoolAcquireTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1100..=1199 => "contract",
            1300..=1399 => "work_item",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, illegal transitions)
    Low,
    /// Expected operational outcomes (budget exhaustion, expiry, timeouts)
    Medium,
    /// Misconfiguration or failed work
    High,
    /// Bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidStateTransition
            | ErrorCode::InvalidAmount
            | ErrorCode::InputRejected
            | ErrorCode::LedgerSealed => Self::Low,

            ErrorCode::ResourceExhausted
            | ErrorCode::ConservationViolation
            | ErrorCode::ContractExpired
            | ErrorCode::ContractTerminated
            | ErrorCode::WorkItemTimeout
            | ErrorCode::WorkItemCancelled
            | ErrorCode::PoolAcquireTimeout => Self::Medium,

            ErrorCode::WorkItemFailed
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InvalidBudget
            | ErrorCode::InvalidThreshold => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (contract, work item, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Covenant Core.
#[derive(Error, Debug)]
pub struct CovenantError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CovenantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CovenantError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both public and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let context = std::mem::take(&mut self.details.context);
        self.details = details;
        self.details.context.extend(context);
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "covenant_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CovenantError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| CovenantError::new(code, e.to_string()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for CovenantError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for CovenantError {
    fn from(error: config::ConfigError) -> Self {
        let (code, message) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, message, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl CovenantError {
    // ─────────────────────────────────────────────────────────────────────────
    // Contract Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A consumption request would push a dimension over its budget.
    pub fn resource_exhausted(dimension: ResourceDimension, requested: f64, remaining: f64) -> Self {
        Self::new(
            ErrorCode::ResourceExhausted,
            format!(
                "Resource {} exhausted: requested {}, remaining {}",
                dimension, requested, remaining
            ),
        )
        .with_context("dimension", dimension)
        .with_context("requested", requested)
        .with_context("remaining", remaining)
    }

    /// A child budget does not fit inside its parent.
    pub fn conservation_violation(dimension: ResourceDimension, parent: f64, child: f64) -> Self {
        Self::new(
            ErrorCode::ConservationViolation,
            format!(
                "Conservation violation on {}: parent capacity {} < child demand {}",
                dimension, parent, child
            ),
        )
        .with_context("dimension", dimension)
        .with_context("parent_capacity", parent)
        .with_context("child_demand", child)
        .with_details(
            ErrorDetails::new().with_suggestion("Request a smaller allocation or serialize the work"),
        )
    }

    /// The contract's temporal window elapsed.
    pub fn contract_expired(contract_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::ContractExpired, "Contract expired (time limit exceeded)")
            .with_details(ErrorDetails::new().with_entity("contract", contract_id.to_string()))
    }

    /// An operation was attempted from a state that does not allow it.
    pub fn invalid_state_transition(
        contract_id: uuid::Uuid,
        from: ContractState,
        to: ContractState,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid contract state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
        .with_details(ErrorDetails::new().with_entity("contract", contract_id.to_string()))
    }

    /// A consumption amount is negative or not finite.
    pub fn invalid_amount(dimension: ResourceDimension, amount: f64) -> Self {
        Self::new(
            ErrorCode::InvalidAmount,
            format!("Invalid amount {} for {}", amount, dimension),
        )
        .with_context("dimension", dimension)
    }

    /// Input did not satisfy the contract's input specification.
    pub fn input_rejected(errors: Vec<String>) -> Self {
        Self::new(
            ErrorCode::InputRejected,
            format!("Input rejected: {}", errors.join("; ")),
        )
        .with_context("errors", errors)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Work Item Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The injected work executor reported a failure.
    pub fn work_item_failed(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let item_id = item_id.into();
        Self::new(
            ErrorCode::WorkItemFailed,
            format!("Work item {} failed: {}", item_id, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("work_item", item_id))
    }

    /// The work item exceeded its timeout.
    pub fn work_item_timeout(item_id: impl Into<String>, timeout: std::time::Duration) -> Self {
        let item_id = item_id.into();
        Self::new(
            ErrorCode::WorkItemTimeout,
            format!("Work item {} timed out after {:?}", item_id, timeout),
        )
        .with_context("timeout_ms", timeout.as_millis() as u64)
        .with_details(ErrorDetails::new().with_entity("work_item", item_id))
    }

    /// The scheduler was cancelled while the item was pending or running.
    pub fn work_item_cancelled(item_id: impl Into<String>) -> Self {
        let item_id = item_id.into();
        Self::new(
            ErrorCode::WorkItemCancelled,
            format!("Work item {} cancelled", item_id),
        )
        .with_details(ErrorDetails::new().with_entity("work_item", item_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// A budget value is negative or NaN.
    pub fn invalid_budget(dimension: ResourceDimension, value: f64) -> Self {
        Self::new(
            ErrorCode::InvalidBudget,
            format!("Invalid budget {} for {}", value, dimension),
        )
        .with_context("dimension", dimension)
    }

    /// A ratio or threshold lies outside its legal range.
    pub fn invalid_threshold(name: &str, value: f64) -> Self {
        Self::new(
            ErrorCode::InvalidThreshold,
            format!("Invalid value {} for {}", value, name),
        )
        .with_context("name", name)
        .with_context("value", value)
    }

    /// Budgets cannot change once the ledger is sealed by activation.
    pub fn ledger_sealed(dimension: ResourceDimension) -> Self {
        Self::new(
            ErrorCode::LedgerSealed,
            format!("Budget for {} cannot change after activation", dimension),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::ConservationViolation.is_retryable());
        assert!(ErrorCode::WorkItemTimeout.is_retryable());
        assert!(!ErrorCode::InvalidBudget.is_retryable());
        assert!(!ErrorCode::InvalidStateTransition.is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(ErrorCode::ResourceExhausted.category(), "contract");
        assert_eq!(ErrorCode::WorkItemFailed.category(), "work_item");
        assert_eq!(ErrorCode::LedgerSealed.category(), "configuration");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_error_creation() {
        let error = CovenantError::resource_exhausted(ResourceDimension::Tokens, 10.0, 5.0);
        assert_eq!(error.code(), ErrorCode::ResourceExhausted);
        assert_eq!(error.severity(), ErrorSeverity::Medium);
        assert!(error.details().context.contains_key("dimension"));
    }

    #[test]
    fn test_conservation_violation_keeps_context_and_suggestion() {
        let error =
            CovenantError::conservation_violation(ResourceDimension::Iterations, 3.0, 5.0);

        assert!(error.details().context.contains_key("parent_capacity"));
        assert!(error.details().suggested_action.is_some());
    }

    #[test]
    fn test_error_details_builder() {
        let details = ErrorDetails::new()
            .with_entity("contract", "abc-123")
            .with_suggestion("Try a smaller allocation")
            .with_context("extra", "info");

        assert_eq!(details.entity_type, Some("contract".to_string()));
        assert_eq!(details.entity_id, Some("abc-123".to_string()));
        assert!(details.suggested_action.is_some());
        assert!(details.context.contains_key("extra"));
    }

    #[test]
    fn test_error_display() {
        let error = CovenantError::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration file is invalid",
            "expected a float for reserve_buffer",
        );

        let display = format!("{}", error);
        assert!(display.contains("InvalidConfiguration"));
        assert!(display.contains("Configuration file is invalid"));
        assert!(display.contains("reserve_buffer"));
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidStateTransition),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ContractExpired),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidBudget),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InternalError),
            ErrorSeverity::Critical
        );
    }
}
