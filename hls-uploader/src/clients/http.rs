use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ClientError;

const DEFAULT_USER_AGENT: &str = concat!("hls-uploader/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // another crate installed one first
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client`.
///
/// A zero `request_timeout` leaves requests without a client-wide deadline.
pub fn build_http_client(
    user_agent: Option<&str>,
    request_timeout: Duration,
) -> Result<reqwest::Client, ClientError> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
        .connect_timeout(Duration::from_secs(15))
        .pool_idle_timeout(Duration::from_secs(90));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    builder
        .build()
        .map_err(|e| ClientError::configuration(format!("failed to build HTTP client: {e}")))
}

/// Race `fut` against `token`.
pub async fn with_cancellation<T, F>(token: &CancellationToken, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ClientError::Cancelled),
        result = fut => result,
    }
}

/// Map a non-success status to [`ClientError::HttpStatus`].
pub(crate) fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ClientError::http_status(
            status,
            response.url().as_str(),
            operation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_wins_over_pending_future() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), _> = with_cancellation(&token, std::future::pending()).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn completed_future_passes_through() {
        let token = CancellationToken::new();
        let result = with_cancellation(&token, async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn client_builds_with_and_without_timeout() {
        assert!(build_http_client(None, Duration::ZERO).is_ok());
        assert!(build_http_client(Some("custom/1.0"), Duration::from_secs(5)).is_ok());
    }
}
