use thiserror::Error;

/// Typed outcome of a failed generation attempt.
///
/// Messages are written for end users: they never contain the bearer
/// credential, and upstream bodies are truncated (HTML gateway pages are
/// suppressed entirely) before they reach a variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("authentication failed: the service rejected the API key (HTTP 401)")]
    Auth,

    #[error("rate limited by the service (HTTP 429); slow down and retry")]
    RateLimited,

    #[error("the gateway timed out waiting for the generation (HTTP 504); 4K renders are the usual culprit — try a lower tier or retry later")]
    GatewayTimeout,

    #[error("{message}")]
    Gateway {
        status: Option<u16>,
        retryable: bool,
        message: String,
    },

    #[error("generation blocked by the content filter ({reason}); retrying the same prompt will not change the outcome")]
    ContentFiltered { reason: String },

    #[error("{message}")]
    ModelUnavailable { message: String },

    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    #[error("image download failed: {message}")]
    DownloadFailure { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("all {attempted} attempts failed; {summary}")]
    BatchExhausted { attempted: usize, summary: String },
}

impl GenerateError {
    /// HTTP status associated with the failure, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            GenerateError::Auth => Some(401),
            GenerateError::RateLimited => Some(429),
            GenerateError::GatewayTimeout => Some(504),
            GenerateError::Gateway { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether a later retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::RateLimited
            | GenerateError::GatewayTimeout
            | GenerateError::NetworkFailure { .. }
            | GenerateError::ModelUnavailable { .. } => true,
            GenerateError::Gateway { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the failure indicates server-side overload that should widen
    /// the inter-request interval of a running batch.
    pub fn is_throttle_signal(&self) -> bool {
        match self {
            GenerateError::RateLimited => true,
            GenerateError::Gateway { status, .. } => {
                matches!(status, Some(502) | Some(503))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_signals_cover_429_and_overloaded_gateways() {
        assert!(GenerateError::RateLimited.is_throttle_signal());
        let overloaded = GenerateError::Gateway {
            status: Some(503),
            retryable: true,
            message: "upstream returned HTTP 503".to_string(),
        };
        assert!(overloaded.is_throttle_signal());
        let timeout = GenerateError::GatewayTimeout;
        assert!(!timeout.is_throttle_signal());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn content_filter_is_not_retryable() {
        let filtered = GenerateError::ContentFiltered {
            reason: "SAFETY".to_string(),
        };
        assert!(!filtered.is_retryable());
        assert_eq!(filtered.status(), None);
    }

    #[test]
    fn status_codes_surface_through_accessor() {
        assert_eq!(GenerateError::Auth.status(), Some(401));
        assert_eq!(GenerateError::RateLimited.status(), Some(429));
        assert_eq!(GenerateError::GatewayTimeout.status(), Some(504));
        let gateway = GenerateError::Gateway {
            status: Some(521),
            retryable: true,
            message: "upstream returned HTTP 521".to_string(),
        };
        assert_eq!(gateway.status(), Some(521));
    }
}
