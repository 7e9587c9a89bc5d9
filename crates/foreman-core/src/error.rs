//! The closed set of error kinds from which every fallible core operation
//! draws (spec §7). Callers branch on [`Error`] rather than the underlying
//! cause; use `anyhow` at the daemon's orchestration edges instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("fatal error: {0}")]
    FatalUnknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
            other => Error::TransientIo(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Integrity(err.to_string())
    }
}

/// The classification of a delegate/process-level failure (spec §4.8, §7).
///
/// This is distinct from [`Error`]: it describes *why* a delegate call
/// failed so the Retry & Fallback component (C8) can look up a policy,
/// whereas [`Error`] is the outward-facing result type of core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    Timeout,
    ModelUnavailable,
    Transient,
    Unknown,
}

impl ErrorKind {
    /// Classify a delegate failure from its exit code and stderr tail, per
    /// spec §4.8. Unrecognized shapes fall back to `Unknown`.
    pub fn classify(exit_code: Option<i32>, stderr: &str) -> ErrorKind {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("auth")
        {
            return ErrorKind::AuthError;
        }
        if lower.contains("rate limit") || lower.contains("429") {
            return ErrorKind::RateLimit;
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorKind::Timeout;
        }
        if lower.contains("model unavailable")
            || lower.contains("service unavailable")
            || lower.contains("503")
        {
            return ErrorKind::ModelUnavailable;
        }
        match exit_code {
            Some(0) => ErrorKind::Unknown,
            Some(_) => ErrorKind::Transient,
            None => ErrorKind::Timeout,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
