//! Job scheduling: a fixed pool of workers polls the job directory, idles on
//! a permit gate refilled by work notifications, and stops once too many jobs
//! fail in a row.

mod error;
mod gate;
mod job;
mod service;
mod streak;

pub use error::{JobError, SchedulerError};
pub use gate::PermitGate;
pub use job::{JobExecutor, JobProcessor};
pub use service::{JobScheduler, SchedulerConfig};
pub use streak::FailureStreak;
