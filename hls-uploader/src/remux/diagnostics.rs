//! Parsing of the remux program's diagnostic output.
//!
//! Only the last resolution and the last progress timestamp matter: the
//! program reports the input stream first and the written output last.

use std::sync::LazyLock;

use regex::Regex;

static RESOLUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Video: .*? (\d{3,4})x(\d{3,4})").expect("valid resolution regex")
});

static PROGRESS_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d{2}):(\d{2}):(\d{2}).(\d{2})").expect("valid progress regex")
});

/// Media properties recovered from the diagnostic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDiagnostics {
    pub width: u32,
    pub height: u32,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("no video resolution found in remux output")]
    MissingResolution,
    #[error("no progress timestamp found in remux output")]
    MissingDuration,
    #[error("number out of range in remux output: {0}")]
    InvalidNumber(String),
}

/// Extract resolution and duration from the full diagnostic text.
pub fn parse(output: &str) -> Result<MediaDiagnostics, DiagnosticsError> {
    let (width, height) = parse_resolution(output)?;
    let duration_secs = parse_duration(output)?;
    Ok(MediaDiagnostics {
        width,
        height,
        duration_secs,
    })
}

/// Last `WIDTHxHEIGHT` reported on a `Video:` stream line.
pub fn parse_resolution(output: &str) -> Result<(u32, u32), DiagnosticsError> {
    let caps = RESOLUTION_RE
        .captures_iter(output)
        .last()
        .ok_or(DiagnosticsError::MissingResolution)?;
    Ok((number(&caps[1])?, number(&caps[2])?))
}

/// Last `time=HH:MM:SS.hh` progress value, in whole seconds rounded up.
pub fn parse_duration(output: &str) -> Result<u32, DiagnosticsError> {
    let caps = PROGRESS_TIME_RE
        .captures_iter(output)
        .last()
        .ok_or(DiagnosticsError::MissingDuration)?;
    Ok(duration_from_parts(
        number(&caps[1])?,
        number(&caps[2])?,
        number(&caps[3])?,
        number(&caps[4])?,
    ))
}

/// `h*3600 + m*60 + s`, plus one second for any non-zero fraction.
pub fn duration_from_parts(hours: u32, minutes: u32, seconds: u32, hundredths: u32) -> u32 {
    hours * 3600 + minutes * 60 + seconds + hundredths.div_ceil(100)
}

fn number(text: &str) -> Result<u32, DiagnosticsError> {
    text.parse()
        .map_err(|_| DiagnosticsError::InvalidNumber(text.to_string()))
}
