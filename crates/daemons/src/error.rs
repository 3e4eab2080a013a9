use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    #[error("daemon call timed out after {0}s")]
    Timeout(u64),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(&'static str),

    #[error("conflicting state: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("daemon reported failure: {0}")]
    Backend(String),

    #[error("malformed daemon response: {0}")]
    Decode(String),
}

impl DaemonError {
    /// Transient errors are worth retrying with backoff; the rest surface
    /// immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaemonError::Unavailable(_) | DaemonError::Timeout(_) | DaemonError::Backend(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
