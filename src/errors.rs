//! Typed error hierarchy for the setup tool.
//!
//! Four enums cover the subsystems:
//! - `ApiError`: classified failures from the remote workspace API
//! - `StepError`: step handler failures, already classified into an [`ErrorKind`]
//! - `RegistryError`: a malformed step graph (fatal at startup)
//! - `StateError`: an illegal step transition requested of the state store
//!
//! The orchestrator decides retry vs. halt from [`StepError::kind`] alone.

use std::fmt;
use thiserror::Error;

/// Errors from the remote workspace API, classified from HTTP status and error code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Workspace API error (HTTP {status}): {message}")]
    Other { status: u16, message: String },
}

impl ApiError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        ApiError::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ApiError::PermissionDenied { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// Classified kind of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Prerequisite,
    Permission,
    Conflict,
    TransientNetwork,
    Subprocess,
    Validation,
    Other,
}

impl ErrorKind {
    /// Whether the retry policy may re-invoke the handler.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientNetwork)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Prerequisite => "PrerequisiteError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::TransientNetwork => "TransientNetworkError",
            ErrorKind::Subprocess => "SubprocessError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Other => "Error",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised by step handlers.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("Permission denied: {message}")]
    Permission { message: String, remediation: String },

    #[error("Conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("`{command}` exited with code {exit_code}")]
    Subprocess {
        command: String,
        exit_code: i32,
        tail: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Prerequisite(_) => ErrorKind::Prerequisite,
            StepError::Permission { .. } => ErrorKind::Permission,
            StepError::Conflict { .. } => ErrorKind::Conflict,
            StepError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            StepError::Subprocess { .. } => ErrorKind::Subprocess,
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Other(_) => ErrorKind::Other,
        }
    }

    /// Full text recorded as the step's `error`: the message plus any
    /// remediation instructions or captured output tail.
    pub fn report(&self) -> String {
        match self {
            StepError::Permission { remediation, .. } if !remediation.is_empty() => {
                format!("{}\n{}", self, remediation)
            }
            StepError::Subprocess { tail, .. } if !tail.is_empty() => {
                format!("{}\n--- output tail ---\n{}", self, tail)
            }
            _ => self.to_string(),
        }
    }
}

impl From<ApiError> for StepError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transient(msg) => StepError::TransientNetwork(msg),
            ApiError::Unauthenticated(msg) => StepError::Prerequisite(format!(
                "not authenticated to the workspace ({}). Run `databricks auth login` and retry.",
                msg
            )),
            ApiError::PermissionDenied { message } => StepError::Permission {
                message,
                remediation: String::new(),
            },
            other => StepError::Other(anyhow::Error::new(other)),
        }
    }
}

/// Errors found while validating the static step graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cycle detected among steps: {0}")]
    Cycle(String),
}

/// Errors from illegal transitions requested of the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unknown step id: {0}")]
    UnknownStep(String),

    #[error("Illegal transition for step {step}: {from} -> {to}")]
    IllegalTransition {
        step: String,
        from: String,
        to: String,
    },

    #[error("Step {step} cannot start: dependency {dependency} is {status}")]
    DependencyNotMet {
        step: String,
        dependency: String,
        status: String,
    },

    #[error("No active session")]
    NoSession,

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
