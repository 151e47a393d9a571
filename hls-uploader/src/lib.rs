//! hls-uploader library crate.
//!
//! Background worker that turns queued jobs into uploaded videos: it resolves
//! an HLS playlist, downloads segments concurrently, streams them in order
//! through ffmpeg, and publishes the result.

pub mod app;
pub mod assembly;
pub mod clients;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod remux;
pub mod retry;
pub mod scheduler;

pub use error::{Error, Result};
