use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::JobError;
use crate::assembly::VideoAssembler;
use crate::clients::{UploadRequest, UploadSink};
use crate::model::{JobDescriptor, ResultToken};

/// Runs one job to completion and yields the token to report.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
    ) -> Result<ResultToken, JobError>;
}

/// Assembles the video for a job and uploads it.
#[derive(Clone)]
pub struct JobProcessor {
    assembler: VideoAssembler,
    uploader: Arc<dyn UploadSink>,
}

impl JobProcessor {
    pub fn new(assembler: VideoAssembler, uploader: Arc<dyn UploadSink>) -> Self {
        Self {
            assembler,
            uploader,
        }
    }
}

#[async_trait]
impl JobExecutor for JobProcessor {
    async fn execute(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
    ) -> Result<ResultToken, JobError> {
        let caption = job
            .caption()
            .map_err(|e| JobError::InvalidJob(format!("cannot encode caption: {e}")))?;

        let video = self.assembler.assemble(job, token).await?;
        info!(
            width = video.info.width,
            height = video.info.height,
            duration_secs = video.info.duration_secs,
            "Video assembled"
        );

        let request = UploadRequest {
            path: video.path(),
            info: &video.info,
            caption: &caption,
            thumbnail: video.thumbnail.as_ref(),
        };
        let uploaded = self.uploader.upload(request, token).await;

        debug!("Removing remuxed file");
        video.finish().await;
        uploaded.map_err(JobError::Upload)
    }
}
