//! Error handling for Taskline.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - Retryability classification used by the transport-level retry loops
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskline_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load() -> Result<()> {
//!     std::fs::read_to_string("jobs.json")
//!         .with_error_code(ErrorCode::ConfigurationError)?;
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::jobs::{JobId, JobState};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Taskline operations.
pub type Result<T> = std::result::Result<T, TasklineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are what the admin CLI prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    InvalidStateTransition,
    JobAlreadySettled,
    JobOrphaned,
    ConcurrentModification,
    JobFailed,

    // Queue Errors (1100-1199)
    QueueAlreadyRegistered,
    StrategyNotInitialized,
    StrategyShutDown,

    // Worker Bridge Errors (1200-1299)
    WorkerPatternNotRegistered,
    WorkerPatternConflict,
    WorkerUnreachable,
    WorkerDisconnected,
    WorkerHandlerFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Broker Errors (2100-2199)
    BrokerError,
    BrokerConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Network Errors (3000-3099)
    NetworkError,
    Timeout,

    // Validation Errors (4100-4199)
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Job Errors
            Self::JobNotFound => 1000,
            Self::InvalidStateTransition => 1001,
            Self::JobAlreadySettled => 1002,
            Self::JobOrphaned => 1003,
            Self::ConcurrentModification => 1004,
            Self::JobFailed => 1005,

            // Queue Errors
            Self::QueueAlreadyRegistered => 1100,
            Self::StrategyNotInitialized => 1102,
            Self::StrategyShutDown => 1103,

            // Worker Bridge Errors
            Self::WorkerPatternNotRegistered => 1200,
            Self::WorkerPatternConflict => 1201,
            Self::WorkerUnreachable => 1202,
            Self::WorkerDisconnected => 1203,
            Self::WorkerHandlerFailed => 1204,

            // Database Errors
            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            // Broker Errors
            Self::BrokerError => 2100,
            Self::BrokerConnectionFailed => 2101,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            // Network Errors
            Self::NetworkError => 3000,
            Self::Timeout => 3001,

            // Validation Errors
            Self::InvalidInput => 4101,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
        }
    }

    /// Check if this error is transient at the transport level.
    ///
    /// Handler rejections never carry one of these codes; they are driven by
    /// the job state machine instead.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::BrokerConnectionFailed
                | Self::BrokerError
                | Self::NetworkError
                | Self::Timeout
                | Self::WorkerUnreachable
                | Self::ConcurrentModification
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "queue",
            1200..=1299 => "worker_bridge",
            2000..=2099 => "database",
            2100..=2199 => "broker",
            2200..=2299 => "serialization",
            3000..=3099 => "network",
            4100..=4199 => "validation",
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
    /// Caller errors (bad input, unknown ids, illegal transitions)
    Low,
    /// Operational issues (timeouts, disconnects, orphaned jobs)
    Medium,
    /// System errors (database failures, serialization bugs)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::JobAlreadySettled
            | ErrorCode::QueueAlreadyRegistered
            | ErrorCode::WorkerPatternNotRegistered
            | ErrorCode::WorkerPatternConflict
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::JobOrphaned
            | ErrorCode::JobFailed
            | ErrorCode::ConcurrentModification
            | ErrorCode::StrategyNotInitialized
            | ErrorCode::StrategyShutDown
            | ErrorCode::WorkerUnreachable
            | ErrorCode::WorkerDisconnected
            | ErrorCode::WorkerHandlerFailed
            | ErrorCode::NetworkError
            | ErrorCode::Timeout => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::BrokerError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::BrokerConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
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

    /// Related entity ID (job, queue, pattern)
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

/// The main error type for Taskline.
///
/// This error type supports:
/// - Structured error codes
/// - Error chaining with context
/// - User-friendly vs internal messages
/// - Metrics integration
#[derive(Error, Debug)]
pub struct TasklineError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TasklineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TasklineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
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
        self.details = details;
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

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is transient and may be retried by the transport layer.
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
                    user_message = %self.user_message,
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
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "taskline_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
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
        self.map_err(|e| TasklineError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| TasklineError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| TasklineError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| TasklineError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for TasklineError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for TasklineError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::BrokerConnectionFailed, "Unable to connect to the broker")
        } else if error.is_timeout() {
            (ErrorCode::BrokerError, "Broker operation timed out")
        } else {
            (ErrorCode::BrokerError, "A broker error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TasklineError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TasklineError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for TasklineError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                (ErrorCode::WorkerUnreachable, "Connection failed")
            }
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
                (ErrorCode::WorkerDisconnected, "Connection closed")
            }
            _ => (ErrorCode::NetworkError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for TasklineError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<TasklineError>() {
            Ok(taskline_error) => taskline_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for TasklineError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
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

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl TasklineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Job Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a job not found error.
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(job_id: JobId, from: JobState, to: JobState) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {} -> {}", from, to),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
        .with_context("from_state", from.to_string())
        .with_context("to_state", to.to_string())
    }

    /// Create an error for an attempted mutation of a settled job.
    pub fn job_already_settled(job_id: JobId, state: JobState) -> Self {
        Self::new(
            ErrorCode::JobAlreadySettled,
            format!("Job {} is already settled ({})", job_id, state),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Create the error of a job that failed after its handler's last attempt.
    pub fn job_failed(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::JobFailed, message.into())
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Create the error of a job failed by stale-lock recovery.
    pub fn job_orphaned(job_id: JobId) -> Self {
        Self::new(ErrorCode::JobOrphaned, crate::jobs::ORPHANED_ERROR_MESSAGE)
            .with_details(
                ErrorDetails::new()
                    .with_entity("job", job_id.to_string())
                    .with_suggestion("Retry the job once its handler is known to be idempotent"),
            )
    }

    /// Create an error for a job that kept changing under a compare-and-swap.
    pub fn concurrent_modification(job_id: JobId) -> Self {
        Self::new(
            ErrorCode::ConcurrentModification,
            format!("Job {} was modified concurrently; try again", job_id),
        )
        .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queue Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a duplicate queue registration error.
    pub fn queue_already_registered(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::QueueAlreadyRegistered,
            format!("A job queue named '{}' is already registered", name),
        )
        .with_details(ErrorDetails::new().with_entity("queue", &name))
    }

    /// Create a strategy shut down error.
    pub fn strategy_shut_down() -> Self {
        Self::new(ErrorCode::StrategyShutDown, "The job queue strategy has been destroyed")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker Bridge Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a pattern not registered error.
    pub fn pattern_not_registered(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self::new(
            ErrorCode::WorkerPatternNotRegistered,
            format!("No worker handler registered for pattern '{}'", pattern),
        )
        .with_details(ErrorDetails::new().with_entity("pattern", &pattern))
    }

    /// Create a duplicate pattern registration error.
    pub fn pattern_conflict(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self::new(
            ErrorCode::WorkerPatternConflict,
            format!("A worker handler for pattern '{}' is already registered", pattern),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("pattern", &pattern)
                .with_suggestion("Give every worker message type a unique pattern"),
        )
    }

    /// Create a worker disconnected error.
    pub fn worker_disconnected(reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::WorkerDisconnected,
            "The connection to the worker process was lost",
            reason,
        )
    }

    /// Create a worker handler failure (an error raised by the worker itself).
    pub fn worker_handler_failed(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self::new(
            ErrorCode::WorkerHandlerFailed,
            format!("Worker handler for '{}' failed: {}", pattern, message.into()),
        )
        .with_details(ErrorDetails::new().with_entity("pattern", &pattern))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
