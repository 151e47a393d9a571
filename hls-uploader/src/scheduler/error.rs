use std::time::Duration;

use thiserror::Error;

use crate::assembly::AssemblyError;
use crate::clients::ClientError;

/// Why a single job failed. Every variant is reported to the job directory
/// as a failed result.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("upload failed: {0}")]
    Upload(#[source] ClientError),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Assembly(e) => e.is_cancelled(),
            Self::Upload(e) => e.is_cancelled(),
            Self::Cancelled => true,
            Self::InvalidJob(_) | Self::Timeout(_) => false,
        }
    }
}

/// Pool-level failures that stop the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("stopped after {failures} consecutive failures")]
    FailureStreakExceeded { failures: usize },

    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
