//! Error types for the external authorization service

use thiserror::Error;
use tonic::Code;

/// External authorization error types
#[derive(Debug, Error)]
pub enum ExtAuthError {
    /// Configuration could not be read or is invalid
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Placeholder template could not be parsed or rendered
    #[error("template error: {message}")]
    Template {
        /// Error message
        message: String,
    },

    /// A phase tried to write into a region it does not own
    #[error("phase violation: {message}")]
    PhaseViolation {
        /// Error message
        message: String,
    },

    /// gRPC transport error
    #[error("gRPC error: {message}")]
    Grpc {
        /// Error message
        message: String,
    },

    /// I/O error while reading configuration
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtAuthError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a phase violation error
    pub fn phase_violation(msg: impl Into<String>) -> Self {
        Self::PhaseViolation {
            message: msg.into(),
        }
    }

    /// Create a gRPC error
    pub fn grpc(msg: impl Into<String>) -> Self {
        Self::Grpc {
            message: msg.into(),
        }
    }
}

impl From<serde_yaml::Error> for ExtAuthError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::configuration(e.to_string())
    }
}

/// Result type for external authorization operations
pub type Result<T> = std::result::Result<T, ExtAuthError>;

/// Failure produced by a single evaluator call
///
/// `message` is what the proxy gets to see in the reason header. `detail`
/// holds the underlying cause and only ever goes to the log.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EvaluatorError {
    /// Denial code this failure asks for, if it has an opinion
    pub code: Option<Code>,
    /// Proxy-facing reason
    pub message: String,
    /// Internal cause, for logs only
    pub detail: Option<String>,
}

impl EvaluatorError {
    /// Failure without a preferred code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            detail: None,
        }
    }

    /// Failure with a specific denial code
    pub fn with_code(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            detail: None,
        }
    }

    /// Evaluator configuration is not usable (unsupported method, content type)
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_code(Code::FailedPrecondition, message)
    }

    /// Call observed a cancelled or expired scope
    pub fn cancelled() -> Self {
        Self::with_code(Code::DeadlineExceeded, "evaluation cancelled")
    }

    /// Attach an internal cause
    pub fn detail(mut self, detail: impl std::fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    /// Whether this failure came from cancellation
    pub fn is_cancelled(&self) -> bool {
        self.code == Some(Code::DeadlineExceeded)
    }
}

impl From<reqwest::Error> for EvaluatorError {
    fn from(e: reqwest::Error) -> Self {
        let message = if e.is_timeout() {
            "external call timed out"
        } else if e.is_decode() {
            "failed to decode external response"
        } else {
            "external call failed"
        };
        Self::new(message).detail(e)
    }
}

impl From<ExtAuthError> for EvaluatorError {
    fn from(e: ExtAuthError) -> Self {
        Self::new("failed to resolve evaluator template").detail(e)
    }
}
