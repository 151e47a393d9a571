use reqwest::StatusCode;

/// Errors raised by the HTTP collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("invalid response from {service}: {reason}")]
    InvalidResponse {
        service: &'static str,
        reason: String,
    },

    #[error("{service} rejected the request: {reason}")]
    Rejected {
        service: &'static str,
        reason: String,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl ClientError {
    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn invalid_response(service: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service,
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidResponse { .. }
            | Self::Rejected { .. }
            | Self::Playlist { .. }
            | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Io { .. } => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The server asked us to slow down.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        let err = ClientError::http_status(StatusCode::BAD_GATEWAY, "http://x", "segment");
        assert!(err.is_retryable());
        let err = ClientError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://x", "segment");
        assert!(err.is_retryable());
        assert!(err.is_throttled());
    }

    #[test]
    fn client_errors_are_final() {
        let err = ClientError::http_status(StatusCode::NOT_FOUND, "http://x", "segment");
        assert!(!err.is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
        assert!(!ClientError::playlist("empty").is_retryable());
    }
}
