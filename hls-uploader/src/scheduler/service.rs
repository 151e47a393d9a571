//! Worker pool that polls the job directory and runs jobs.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::error::{JobError, SchedulerError};
use super::gate::PermitGate;
use super::job::JobExecutor;
use super::streak::FailureStreak;
use crate::clients::{ClientError, JobDirectory, NotificationSource};
use crate::config::ProcessingConfig;
use crate::model::{JobDescriptor, ResultToken};

/// Configuration for a [`JobScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker loops, and the size of every permit burst.
    pub workers: usize,
    /// Upper bound for a single job, assembly and upload included.
    ///
    /// On expiry the job future is dropped, which kills its remux process.
    pub job_timeout: Duration,
    /// Consecutive failures after which the pool stops polling.
    pub max_sequential_failures: usize,
    /// Deadline for reporting a job result.
    pub report_timeout: Duration,
    /// Pause after a failed job-directory poll.
    pub poll_error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ProcessingConfig::default())
    }
}

impl From<&ProcessingConfig> for SchedulerConfig {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            workers: config.workers,
            job_timeout: config.job_timeout(),
            max_sequential_failures: config.max_sequential_failures,
            report_timeout: config.report_timeout(),
            poll_error_backoff: config.poll_error_backoff(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.max_sequential_failures == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_sequential_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

struct Shared {
    config: SchedulerConfig,
    directory: Arc<dyn JobDirectory>,
    notifications: Arc<dyn NotificationSource>,
    executor: Arc<dyn JobExecutor>,
    gate: PermitGate,
    streak: FailureStreak,
    /// Streak length at the moment the breaker tripped.
    tripped_at: OnceLock<usize>,
}

/// Pulls jobs from a [`JobDirectory`] with a fixed number of workers.
///
/// Idle workers park on a [`PermitGate`] that a notification watcher refills
/// whenever new work may exist. A shared [`FailureStreak`] stops the pool
/// once too many jobs fail in a row.
#[derive(Clone)]
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        directory: Arc<dyn JobDirectory>,
        notifications: Arc<dyn NotificationSource>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                gate: PermitGate::new(config.workers),
                streak: FailureStreak::new(config.max_sequential_failures),
                tripped_at: OnceLock::new(),
                config,
                directory,
                notifications,
                executor,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn gate(&self) -> &PermitGate {
        &self.shared.gate
    }

    pub fn failure_streak(&self) -> &FailureStreak {
        &self.shared.streak
    }

    /// Run the pool until `token` is cancelled or the failure streak trips.
    ///
    /// Jobs already executing when the breaker trips run to completion; an
    /// external cancellation aborts them and reports them as failed.
    pub async fn run(&self, token: CancellationToken) -> Result<(), SchedulerError> {
        let workers = self.shared.config.workers;
        info!(
            workers,
            max_failures = self.shared.config.max_sequential_failures,
            "Starting job scheduler"
        );

        let stop = token.child_token();
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let shared = self.shared.clone();
            let token = token.clone();
            let stop = stop.clone();
            tasks.spawn(
                async move { shared.worker_loop(&token, &stop).await }
                    .instrument(info_span!("worker", id)),
            );
        }
        let shared = self.shared.clone();
        let watcher_stop = stop.clone();
        tasks.spawn(
            async move { shared.watch_notifications(&watcher_stop).await }
                .instrument(info_span!("watcher")),
        );

        let mut panicked = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!(error = %e, "Scheduler task panicked, stopping");
                stop.cancel();
                panicked.get_or_insert_with(|| e.to_string());
            }
        }

        if let Some(reason) = panicked {
            return Err(SchedulerError::WorkerPanicked(reason));
        }
        if let Some(&failures) = self.shared.tripped_at.get() {
            return Err(SchedulerError::FailureStreakExceeded { failures });
        }
        info!("Job scheduler stopped");
        Ok(())
    }

    /// Poll once and process the job if there is one, without the watcher.
    ///
    /// Returns whether a job was processed. Job failures are reported to the
    /// directory, not returned.
    pub async fn run_once(&self, token: CancellationToken) -> Result<bool, ClientError> {
        let Some(job) = self.shared.directory.next_job(&token).await? else {
            info!("No job available");
            return Ok(false);
        };
        let span = info_span!("job", key = %job, hash = %job.hash());
        self.shared
            .process(&job, &token, &token.child_token())
            .instrument(span)
            .await;
        Ok(true)
    }
}

impl Shared {
    async fn worker_loop(&self, token: &CancellationToken, stop: &CancellationToken) {
        debug!("Worker started");
        while !stop.is_cancelled() {
            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                polled = self.directory.next_job(stop) => polled,
            };

            match polled {
                Ok(Some(job)) => {
                    let span = info_span!("job", key = %job, hash = %job.hash());
                    self.process(&job, token, stop).instrument(span).await;
                }
                Ok(None) => {
                    trace!("No job available, waiting for a permit");
                    if !self.gate.acquire(stop).await {
                        break;
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    let failures = self.record_failure(stop);
                    warn!(
                        error = %e,
                        failures,
                        retry_in_secs = self.config.poll_error_backoff.as_secs(),
                        "Failed to poll job directory"
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_error_backoff) => {}
                    }
                }
            }
        }
        debug!("Worker stopped");
    }

    async fn watch_notifications(&self, stop: &CancellationToken) {
        debug!("Notification watcher started");
        loop {
            let signal = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                signal = self.notifications.wait_for_signal(stop) => signal,
            };

            match signal {
                Ok(()) => {
                    let released = self.gate.release_burst();
                    debug!(released, "Work notification received");
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!(error = %e, "Notification source failed");
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_error_backoff) => {}
                    }
                }
            }
        }
        debug!("Notification watcher stopped");
    }

    /// Execute `job` and report its outcome exactly once.
    async fn process(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
        stop: &CancellationToken,
    ) {
        info!("Processing job");
        let job_token = token.child_token();
        let timeout = self.config.job_timeout;

        let outcome =
            match tokio::time::timeout(timeout, self.executor.execute(job, &job_token)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(timeout)),
            };
        job_token.cancel();

        let result = match outcome {
            Ok(result) => {
                self.streak.reset();
                info!(result = %result, "Job completed");
                Some(result)
            }
            Err(e) if token.is_cancelled() => {
                warn!(error = %e, "Job aborted by shutdown");
                None
            }
            Err(e) => {
                let failures = self.record_failure(stop);
                error!(
                    error = %e,
                    failures,
                    max_failures = self.streak.max(),
                    "Job failed"
                );
                None
            }
        };

        self.report(job, result.as_ref()).await;
    }

    /// Report under a deadline of its own so a cancelled job is still reported.
    async fn report(&self, job: &JobDescriptor, result: Option<&ResultToken>) {
        let report_token = CancellationToken::new();
        let reported = tokio::time::timeout(
            self.config.report_timeout,
            self.directory.report_result(job, result, &report_token),
        )
        .await;

        match reported {
            Ok(Ok(())) => debug!(success = result.is_some(), "Reported job result"),
            Ok(Err(e)) => warn!(error = %e, "Failed to report job result"),
            Err(_) => warn!(
                timeout_secs = self.config.report_timeout.as_secs(),
                "Timed out reporting job result"
            ),
        }
    }

    fn record_failure(&self, stop: &CancellationToken) -> usize {
        let failures = self.streak.record_failure();
        if failures >= self.streak.max() && self.tripped_at.set(failures).is_ok() {
            error!(failures, "Too many consecutive failures, stopping the scheduler");
            stop.cancel();
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_follow_processing_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert_eq!(config.max_sequential_failures, 3);
        assert_eq!(config.report_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = SchedulerConfig {
            workers: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_failure_threshold_rejected() {
        let config = SchedulerConfig {
            max_sequential_failures: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
