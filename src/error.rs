use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Error taxonomy for every crawl subsystem. Each variant maps to one of the
/// failure families a caller needs to distinguish: bad input that will never
/// succeed on retry, a transient backend hiccup that will, storage
/// consistency lag, a state-machine mismatch, a task-level failure surfaced
/// from user code, or resource exhaustion.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("consistency lag: {0}")]
    ConsistencyLag(String),

    #[error("state mismatch: {0}")]
    StateMismatch(String),

    #[error("task error: {0}")]
    TaskError(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("storage client error: {0}")]
    StorageClientError(String),

    #[error("semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl CrawlError {
    /// Whether this error represents a condition that may clear on its own —
    /// the caller's retry policy decides how many times and with what
    /// backoff, this only says whether retrying is ever worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Transient(_)
                | CrawlError::NetworkError(_)
                | CrawlError::Timeout(_)
                | CrawlError::ConsistencyLag(_)
                | CrawlError::StorageClientError(_)
                | CrawlError::ResourceExhausted(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CrawlError::InvalidInput(_) | CrawlError::InvalidUrl(_) => ErrorSeverity::Low,
            CrawlError::ConfigurationError(_) => ErrorSeverity::High,
            CrawlError::MemoryLimitExceeded => ErrorSeverity::High,
            CrawlError::StateMismatch(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for CrawlError {
    fn from(err: AcquireError) -> Self {
        CrawlError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrawlError::Timeout(Duration::from_secs(0))
        } else {
            CrawlError::NetworkError(err.to_string())
        }
    }
}

impl From<url::ParseError> for CrawlError {
    fn from(err: url::ParseError) -> Self {
        CrawlError::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(CrawlError::Transient("x".into()).is_retryable());
        assert!(CrawlError::ConsistencyLag("x".into()).is_retryable());
        assert!(!CrawlError::InvalidInput("x".into()).is_retryable());
        assert!(!CrawlError::StateMismatch("x".into()).is_retryable());
    }

    #[test]
    fn test_severity() {
        assert_eq!(CrawlError::InvalidUrl("x".into()).severity(), ErrorSeverity::Low);
        assert_eq!(CrawlError::MemoryLimitExceeded.severity(), ErrorSeverity::High);
        assert_eq!(CrawlError::Transient("x".into()).severity(), ErrorSeverity::Medium);
    }
}
