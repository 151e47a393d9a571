//! Wiring of the configured collaborators into a [`JobScheduler`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::assembly::{HttpPlaylistResolver, HttpSegmentFetcher, VideoAssembler};
use crate::clients::{
    HttpJobDirectory, HttpNotificationSource, TelegramUploadSink, build_http_client,
};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::remux::RemuxEngine;
use crate::retry::RetryPolicy;
use crate::scheduler::{JobProcessor, JobScheduler, SchedulerConfig};

/// The assembled worker process.
pub struct App {
    scheduler: JobScheduler,
}

impl App {
    /// Build every collaborator from a validated configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = build_http_client(
            config.download.user_agent.as_deref(),
            config.download.request_timeout(),
        )?;

        let directory = HttpJobDirectory::new(
            client.clone(),
            required_url(&config.directory.base_url, "directory.base_url")?,
        )?;
        let notifications = HttpNotificationSource::new(
            client.clone(),
            required_url(&config.notification.url, "notification.url")?.clone(),
            config.notification.wait_time(),
            config.notification.error_retry(),
        );

        let resolver = HttpPlaylistResolver::new(
            client.clone(),
            required_url(&config.source.base_url, "source.base_url")?.clone(),
            config.download.use_lowest_quality,
        );
        let fetcher = HttpSegmentFetcher::new(
            client.clone(),
            RetryPolicy::new(
                config.download.segment_retries,
                config.download.retry_base_delay(),
            ),
        );
        let assembler = VideoAssembler::new(
            Arc::new(resolver),
            Arc::new(fetcher),
            RemuxEngine::new(config.remux.clone()),
            config.download.concurrent_downloads,
        );

        let telegram = &config.telegram;
        let uploader = TelegramUploadSink::new(
            client,
            &telegram.api_url,
            telegram.bot_token.as_deref().unwrap_or_default(),
            telegram.chat_id.clone().unwrap_or_default(),
            telegram.timeout(),
        )?;

        let scheduler = JobScheduler::new(
            SchedulerConfig::from(&config.processing),
            Arc::new(directory),
            Arc::new(notifications),
            Arc::new(JobProcessor::new(assembler, Arc::new(uploader))),
        )?;

        info!(
            workers = config.processing.workers,
            concurrent_downloads = config.download.concurrent_downloads,
            ffmpeg = %config.remux.ffmpeg_path,
            "Worker configured"
        );
        Ok(Self { scheduler })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Run until `token` is cancelled or the failure streak trips.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        Ok(self.scheduler.run(token).await?)
    }

    /// Process at most one job.
    pub async fn run_once(&self, token: CancellationToken) -> Result<bool> {
        Ok(self.scheduler.run_once(token).await?)
    }
}

fn required_url<'a>(url: &'a Option<Url>, key: &str) -> Result<&'a Url> {
    url.as_ref()
        .ok_or_else(|| Error::config(format!("{key} is required")))
}
