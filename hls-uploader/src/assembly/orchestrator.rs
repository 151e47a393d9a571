use std::path::Path;
use std::sync::Arc;

use pipeline_common::{OrderedPipeline, OrderedPipelineError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use super::fetch::SegmentFetcher;
use super::playlist::PlaylistResolver;
use crate::clients::ClientError;
use crate::model::JobDescriptor;
use crate::remux::{RemuxEngine, RemuxError, RemuxSession, VideoInfo};

/// Failure of a single segment inside the ordered pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("download failed: {0}")]
    Fetch(#[source] ClientError),
    #[error("write failed: {0}")]
    Write(#[source] RemuxError),
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("failed to resolve playlist: {0}")]
    Resolve(#[source] ClientError),

    #[error("playlist has no segments")]
    EmptyPlaylist,

    #[error("remux failed: {0}")]
    Remux(#[from] RemuxError),

    #[error("segment pipeline failed: {0}")]
    Pipeline(#[from] OrderedPipelineError<SegmentError>),
}

impl AssemblyError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Resolve(e) => e.is_cancelled(),
            Self::EmptyPlaylist => false,
            Self::Remux(e) => e.is_cancellation(),
            Self::Pipeline(e) => {
                e.is_cancelled()
                    || matches!(
                        e.callback_error(),
                        Some(SegmentError::Fetch(ClientError::Cancelled))
                    )
            }
        }
    }
}

/// A remuxed file waiting to be uploaded.
///
/// Holds the remux session so the temp file stays on disk until
/// [`finish`](Self::finish) disposes it.
#[derive(Debug)]
pub struct AssembledVideo {
    pub info: VideoInfo,
    pub thumbnail: Option<Url>,
    session: RemuxSession,
}

impl AssembledVideo {
    pub fn path(&self) -> &Path {
        &self.info.path
    }

    /// Delete the temp file and release the session.
    pub async fn finish(mut self) {
        self.session.dispose().await;
    }
}

/// Turns a job into a single remuxed file.
#[derive(Clone)]
pub struct VideoAssembler {
    resolver: Arc<dyn PlaylistResolver>,
    fetcher: Arc<dyn SegmentFetcher>,
    engine: RemuxEngine,
    concurrency: usize,
}

impl VideoAssembler {
    pub fn new(
        resolver: Arc<dyn PlaylistResolver>,
        fetcher: Arc<dyn SegmentFetcher>,
        engine: RemuxEngine,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            engine,
            concurrency,
        }
    }

    /// Resolve, download and remux `job`.
    ///
    /// Segments are downloaded concurrently and written to the remux input in
    /// playlist order. On failure the session is disposed before returning.
    pub async fn assemble(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
    ) -> Result<AssembledVideo, AssemblyError> {
        let playlist = self
            .resolver
            .resolve(job, token)
            .await
            .map_err(AssemblyError::Resolve)?;
        if playlist.segments.is_empty() {
            return Err(AssemblyError::EmptyPlaylist);
        }
        info!(segments = playlist.segments.len(), "Resolved playlist");

        let mut session = self.engine.start(token).await?;
        match self.feed(&mut session, playlist.segments, token).await {
            Ok(info) => Ok(AssembledVideo {
                info,
                thumbnail: playlist.thumbnail,
                session,
            }),
            Err(e) => {
                debug!(error = %e, "Assembly failed, disposing remux session");
                session.dispose().await;
                Err(e)
            }
        }
    }

    async fn feed(
        &self,
        session: &mut RemuxSession,
        segments: Vec<Url>,
        token: &CancellationToken,
    ) -> Result<VideoInfo, AssemblyError> {
        let pipeline = OrderedPipeline::new(self.concurrency, token.clone());
        let sink = session.input()?;
        let fetcher = self.fetcher.as_ref();

        let fed = pipeline
            .run_distinct(
                segments,
                |url, index, total| async move {
                    let bytes = fetcher
                        .fetch(&url, token)
                        .await
                        .map_err(SegmentError::Fetch)?;
                    trace!(segment = index + 1, total, "Downloaded segment");
                    Ok::<_, SegmentError>(bytes)
                },
                |bytes, index, total| async move {
                    sink.write(bytes).await.map_err(SegmentError::Write)?;
                    trace!(segment = index + 1, total, "Piped segment");
                    Ok::<_, SegmentError>(())
                },
            )
            .await;

        match fed {
            Ok(()) => Ok(session.complete(token).await?),
            Err(e) if closed_input(&e) => match session.input_closed_cause(token).await? {
                Some(cause) => {
                    debug!(error = %e, "Remux process stopped reading its input");
                    Err(AssemblyError::Remux(cause))
                }
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// The remux process stopped taking input, which usually means it exited.
fn closed_input(err: &OrderedPipelineError<SegmentError>) -> bool {
    matches!(
        err,
        OrderedPipelineError::Consume {
            source: SegmentError::Write(RemuxError::InputClosed),
            ..
        }
    )
}
