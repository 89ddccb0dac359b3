//! Error types for admission, arbitration and job processing

use std::fmt;
use thiserror::Error;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Why the admission gate turned a client away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    /// Client crossed the abuse threshold and is blocked until unblocked by an operator
    Blocked {
        /// Abuse threshold in effect
        threshold: u64,
    },
    /// Client exceeded today's request allowance
    DailyLimitExceeded {
        /// Daily limit in effect
        limit: u64,
    },
}

impl fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { threshold } => write!(
                f,
                "client blocked after exceeding {threshold} requests in one day"
            ),
            Self::DailyLimitExceeded { limit } => {
                write!(f, "daily limit of {limit} requests exceeded, try again tomorrow")
            },
        }
    }
}

/// Comprehensive error types for service operations
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Request refused by the admission gate
    #[error("Admission rejected: {0}")]
    AdmissionRejected(AdmissionRejection),

    /// Malformed, oversized or otherwise unacceptable upload
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// External codec tool exited unsuccessfully
    #[error("{tool} failed ({status}): {diagnostics}")]
    ExternalToolFailed {
        /// Tool name (ffmpeg, ffprobe)
        tool: String,
        /// Exit status description
        status: String,
        /// Captured diagnostic output
        diagnostics: String,
    },

    /// Segmentation capability reported an error
    #[error("Inference error: {0}")]
    InferenceFailed(String),

    /// Accelerator activation, deactivation or lease fault
    #[error("Resource fault: {0}")]
    ResourceFault(String),

    /// Unknown job identifier
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job exists but has no artifact yet
    #[error("Job not ready: {0}")]
    JobNotReady(String),

    /// Work abandoned because its caller went away
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Create a blocked-client rejection
    pub fn blocked(threshold: u64) -> Self {
        Self::AdmissionRejected(AdmissionRejection::Blocked { threshold })
    }

    /// Create a daily-limit rejection
    pub fn daily_limit_exceeded(limit: u64) -> Self {
        Self::AdmissionRejected(AdmissionRejection::DailyLimitExceeded { limit })
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::ValidationFailed(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::InferenceFailed(msg.into())
    }

    /// Create a new resource fault
    pub fn resource_fault<S: Into<String>>(msg: S) -> Self {
        Self::ResourceFault(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an external tool failure from its exit status and captured stderr
    pub fn external_tool<S: Into<String>>(
        tool: &str,
        status: &std::process::ExitStatus,
        diagnostics: S,
    ) -> Self {
        let diagnostics = diagnostics.into();
        Self::ExternalToolFailed {
            tool: tool.to_string(),
            status: status
                .code()
                .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}")),
            diagnostics: if diagnostics.trim().is_empty() {
                "no diagnostic output".to_string()
            } else {
                diagnostics.trim().to_string()
            },
        }
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {rec}"),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range}).{recommendation}"
        ))
    }

    /// HTTP-equivalent status code for the boundary layer
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AdmissionRejected(_) => 429,
            Self::ValidationFailed(_) => 400,
            Self::JobNotFound(_) => 404,
            Self::JobNotReady(_) => 409,
            Self::Cancelled(_) => 499,
            Self::Timeout(_) => 504,
            Self::ExternalToolFailed { .. }
            | Self::InferenceFailed(_)
            | Self::ResourceFault(_)
            | Self::InvalidConfig(_)
            | Self::Io(_)
            | Self::Image(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether a caller could reasonably resubmit the same request
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
