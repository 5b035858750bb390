/// Unified error handling for vigia
///
/// Errors fall in two camps. Anything on the establishment path may be fatal,
/// because nothing else works without a connection. Everything downstream of
/// a successful establishment degrades to partial results instead.
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for vigia operations
#[derive(Debug, Error)]
pub enum VigiaError {
    /// No connection strategy passed its liveness check
    #[error("All connection strategies exhausted, last cause: {last_cause}")]
    ConnectionExhausted { last_cause: StoreError },

    /// The replica-set status command failed; the topology is unknown
    #[error("Topology unavailable: {cause}")]
    TopologyUnavailable { cause: StoreError },

    /// Schema or seeded account setup did not fully succeed
    #[error("Bootstrap incomplete: {}", issues.join("; "))]
    BootstrapIncomplete { issues: Vec<String> },

    /// The sentinel write was not observed through the read handle
    #[error("Replication unverified for sentinel {sentinel_id}: {reason}")]
    ReplicationUnverified { sentinel_id: String, reason: String },

    /// Store operation errors outside the categories above
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors surfaced by a store handle or connector
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("server unreachable: {message}")]
    Unreachable { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("namespace already exists: {namespace}")]
    AlreadyExists { namespace: String },

    #[error("duplicate key: {message}")]
    DuplicateKey { message: String },

    #[error("conflicting index definition: {message}")]
    IndexConflict { message: String },

    #[error("command failed with code {code}: {message}")]
    Command { code: i32, message: String },

    #[error("handle already closed")]
    Closed,

    #[error("{message}")]
    Other { message: String },
}

/// Result type alias for vigia operations
pub type VigiaResult<T> = Result<T, VigiaError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl VigiaError {
    /// Create a connection exhausted error
    pub fn connection_exhausted(last_cause: StoreError) -> Self {
        VigiaError::ConnectionExhausted { last_cause }
    }

    /// Create a topology unavailable error
    pub fn topology_unavailable(cause: StoreError) -> Self {
        VigiaError::TopologyUnavailable { cause }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        VigiaError::Internal {
            message: message.into(),
        }
    }

    /// Whether the calling process should give up on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VigiaError::ConnectionExhausted { .. } | VigiaError::Config(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            VigiaError::ConnectionExhausted { .. } => ErrorSeverity::Critical,
            VigiaError::Config(_) => ErrorSeverity::Critical,
            VigiaError::Internal { .. } => ErrorSeverity::Critical,
            VigiaError::TopologyUnavailable { .. } => ErrorSeverity::Info,
            VigiaError::BootstrapIncomplete { .. } => ErrorSeverity::Warning,
            VigiaError::ReplicationUnverified { .. } => ErrorSeverity::Warning,
            VigiaError::Store(_) => ErrorSeverity::Error,
        }
    }
}

impl StoreError {
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        StoreError::Unreachable {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        StoreError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        StoreError::Other {
            message: message.into(),
        }
    }

    /// "Already exists" conditions that idempotent setup absorbs.
    /// Duplicate keys are not among them: they mean data violates a constraint.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists { .. } | StoreError::IndexConflict { .. }
        )
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
