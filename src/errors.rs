use thiserror::Error;

/// Client-side error taxonomy.
///
/// Every variant is `Clone`: a retry chain for an endpoint is shared between
/// concurrent callers, so its outcome (success or failure) must be cloneable
/// to hand to each of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("CSRF token fetch failed: {0}")]
    TokenFetch(String),

    #[error("request rejected by CSRF protection: {detail}")]
    CsrfRejected { detail: String },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error (status {status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("failed to decode response body: {0}")]
    Decode(String),
}

impl Error {
    /// Classify a reqwest failure, keeping timeouts distinct from other
    /// transport errors.
    pub(crate) fn from_reqwest(err: reqwest::Error, elapsed_ms: u64) -> Self {
        if err.is_timeout() {
            Error::Timeout { elapsed_ms }
        } else {
            Error::Transport(err.to_string())
        }
    }

    /// Whether the failure is transport-level and worth another attempt.
    /// Application errors are never retried.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_carries_wait() {
        let err = Error::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "rate limit exceeded, retry after 42s");
    }

    #[test]
    fn test_timeout_is_transient_but_api_is_not() {
        assert!(Error::Timeout { elapsed_ms: 30000 }.is_transient());
        assert!(Error::Transport("connection refused".into()).is_transient());
        assert!(!Error::Api {
            status: 422,
            detail: "validation failed".into()
        }
        .is_transient());
    }
}
