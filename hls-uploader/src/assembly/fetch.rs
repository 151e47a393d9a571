use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::clients::{ClientError, with_cancellation};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Downloads the bytes of one media segment.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, ClientError>;
}

/// Plain HTTP GET with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpSegmentFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpSegmentFetcher {
    pub fn new(client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Bytes, ClientError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::http_status(status, url.as_str(), "segment"));
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl SegmentFetcher for HttpSegmentFetcher {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, ClientError> {
        let bytes = retry_with_backoff(&self.retry, token, "segment", |_| {
            with_cancellation(token, self.fetch_once(url))
        })
        .await?;
        trace!(url = %url, bytes = bytes.len(), "Fetched segment");
        Ok(bytes)
    }
}
