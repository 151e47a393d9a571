use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::http::{ensure_success, with_cancellation};
use super::{ClientError, NotificationSource};

/// Extra time granted to a long-poll request beyond the server-side wait.
const HANG_PREVENTION_MARGIN: Duration = Duration::from_secs(2);

/// Long-polls an HTTP endpoint for work notifications.
///
/// `GET {url}?wait={secs}`: 200 means a notification was consumed, 204 means
/// the wait elapsed without one.
#[derive(Debug, Clone)]
pub struct HttpNotificationSource {
    client: reqwest::Client,
    url: Url,
    wait_time: Duration,
    error_retry: Duration,
}

enum PollOutcome {
    Signal,
    Empty,
}

impl HttpNotificationSource {
    pub fn new(client: reqwest::Client, url: Url, wait_time: Duration, error_retry: Duration) -> Self {
        Self {
            client,
            url,
            wait_time,
            error_retry,
        }
    }

    fn poll_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("wait", &self.wait_time.as_secs().to_string());
        url
    }

    async fn poll_once(&self) -> Result<PollOutcome, ClientError> {
        let response = self
            .client
            .get(self.poll_url())
            .timeout(self.wait_time + HANG_PREVENTION_MARGIN)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(PollOutcome::Empty);
        }
        ensure_success(response, "wait for notification")?;
        Ok(PollOutcome::Signal)
    }
}

#[async_trait]
impl NotificationSource for HttpNotificationSource {
    async fn wait_for_signal(&self, token: &CancellationToken) -> Result<(), ClientError> {
        loop {
            match with_cancellation(token, self.poll_once()).await {
                Ok(PollOutcome::Signal) => {
                    debug!("Received work notification");
                    return Ok(());
                }
                Ok(PollOutcome::Empty) => trace!("No notification, polling again"),
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = self.error_retry.as_secs(),
                        "Notification poll failed"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(self.error_retry) => {}
                    }
                }
            }
        }
    }
}
