//! External collaborators: the job directory, the work-notification source and
//! the upload sink, each as a trait with an HTTP implementation.

mod directory;
mod error;
mod http;
mod notification;
mod telegram;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::model::{JobDescriptor, ResultToken};
use crate::remux::VideoInfo;

pub use directory::HttpJobDirectory;
pub use error::{ClientError, is_retryable_reqwest_error};
pub use http::{build_http_client, install_rustls_provider, with_cancellation};
pub use notification::HttpNotificationSource;
pub use telegram::TelegramUploadSink;

/// Hands out pending jobs and receives their outcome.
#[async_trait]
pub trait JobDirectory: Send + Sync {
    /// Next pending job, or `None` when the queue is empty.
    async fn next_job(&self, token: &CancellationToken)
    -> Result<Option<JobDescriptor>, ClientError>;

    /// Report the outcome of `job`. `result` is `None` for a failed job.
    async fn report_result(
        &self,
        job: &JobDescriptor,
        result: Option<&ResultToken>,
        token: &CancellationToken,
    ) -> Result<(), ClientError>;
}

/// Long-polled signal that new work may be available.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Resolve once a notification has been received and acknowledged.
    async fn wait_for_signal(&self, token: &CancellationToken) -> Result<(), ClientError>;
}

/// Everything the upload sink needs to publish one video.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub path: &'a Path,
    pub info: &'a VideoInfo,
    pub caption: &'a str,
    pub thumbnail: Option<&'a Url>,
}

/// Publishes finished videos.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload(
        &self,
        request: UploadRequest<'_>,
        token: &CancellationToken,
    ) -> Result<ResultToken, ClientError>;
}
