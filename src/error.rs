//! Error types.

use std::time::Duration;

use thiserror::Error;

use crate::interface::InterfaceId;

/// Result alias for DNS management operations.
pub type Result<T> = std::result::Result<T, DnsError>;

/// Coarse classification of a [`DnsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    TargetNotFound,
    InvalidParameter,
    Unsupported,
    Timeout,
    ExecutionFailed,
    Decode,
    NoSnapshot,
}

/// Errors returned by DNS management operations.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The platform refused the operation (typically missing administrator rights).
    #[error("access denied: {detail}")]
    PermissionDenied {
        /// Diagnostic text reported by the platform.
        detail: String,
    },

    /// The interface or address referenced by the command does not exist.
    #[error("target not found: {detail}")]
    TargetNotFound {
        /// Diagnostic text reported by the platform.
        detail: String,
    },

    /// The platform rejected a parameter (malformed or unreachable address, etc.).
    #[error("invalid parameter: {detail}")]
    InvalidParameter {
        /// Diagnostic text reported by the platform.
        detail: String,
    },

    /// The operation is not available on this platform version.
    #[error("not supported on this platform: {detail}")]
    Unsupported {
        /// Why the operation is unavailable.
        detail: String,
    },

    /// The command did not finish within its time limit and was terminated.
    #[error("command timed out after {}s", .after.as_secs_f64())]
    Timeout {
        /// The limit that was exceeded.
        after: Duration,
    },

    /// Any other command failure.
    #[error("command failed: {0}")]
    ExecutionFailed(String),

    /// The platform returned a payload that could not be decoded.
    #[error("unexpected {what} payload: {source}")]
    Decode {
        /// What was being decoded.
        what: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// No snapshot is held for the interface.
    #[error("no snapshot held for interface {0}")]
    NoSnapshot(InterfaceId),
}

impl DnsError {
    /// Classifies raw diagnostic output from a failed platform command.
    #[must_use]
    pub fn from_diagnostic(text: &str) -> Self {
        let lower = text.to_lowercase();
        let detail = first_line(text);

        if lower.contains("access is denied") || lower.contains("administrator") {
            Self::PermissionDenied { detail }
        } else if lower.contains("does not exist") || lower.contains("no msft_") {
            Self::TargetNotFound { detail }
        } else if lower.contains("parameter is incorrect") || lower.contains("invalid") {
            Self::InvalidParameter { detail }
        } else if lower.contains("not supported") {
            Self::Unsupported { detail }
        } else if detail.is_empty() {
            Self::ExecutionFailed("unknown error".to_string())
        } else {
            Self::ExecutionFailed(detail)
        }
    }

    /// Classifies an I/O error raised while launching a command.
    #[must_use]
    pub fn from_io(err: &std::io::Error, program: &str) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                detail: format!("cannot launch {program}: {err}"),
            }
        } else {
            Self::ExecutionFailed(format!("cannot launch {program}: {err}"))
        }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::NoSnapshot(_) => ErrorKind::NoSnapshot,
        }
    }

    /// Returns `true` if the platform refused the operation for lack of privileges.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Failures are reported once and never retried by this crate.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

/// First non-empty trimmed line of `text`.
fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}
