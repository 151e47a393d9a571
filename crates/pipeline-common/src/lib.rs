//! # Pipeline Common
//!
//! Shared building blocks for segment processing pipelines.
//!
//! ## Features
//!
//! - [`OrderedPipeline`]: runs an async producer over a list of items with a
//!   bounded number of concurrent calls, and feeds the results to an async
//!   consumer strictly in input order
//! - [`OrderedPipelineError`] describing why a run stopped
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod ordered;

pub use ordered::{OrderedPipeline, OrderedPipelineError, SlotStatus};
pub use tokio_util::sync::CancellationToken;
