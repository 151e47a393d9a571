//! Remuxing of a concatenated segment stream into a single MP4 file.
//!
//! A [`RemuxSession`] owns one external process: segments are written to its
//! stdin through a bounded pipe, its diagnostic output is collected while it
//! runs, and resolution and duration are parsed from that output once the
//! process exits.

pub mod diagnostics;
mod engine;
mod error;

pub use engine::{RemuxEngine, RemuxSession, SegmentSink, SessionState, VideoInfo};
pub use error::RemuxError;
