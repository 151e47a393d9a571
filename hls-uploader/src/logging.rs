//! Tracing subscriber setup.

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LoggingConfig;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "hls_uploader=info,pipeline_common=info,process_utils=warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Pick the filter directive.
///
/// Precedence: `--quiet`, `--verbose`, `RUST_LOG`, the config file, then
/// [`DEFAULT_LOG_FILTER`].
pub fn resolve_filter(
    verbose: bool,
    quiet: bool,
    rust_log: Option<String>,
    config: &LoggingConfig,
) -> String {
    if quiet {
        return "error".to_string();
    }
    if verbose {
        return "hls_uploader=debug,pipeline_common=debug,process_utils=debug".to_string();
    }
    rust_log
        .filter(|value| !value.trim().is_empty())
        .or_else(|| config.filter.clone())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Install the global subscriber.
pub fn init_logging(directive: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid filter directive: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_timer(LocalTimer)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_timer(LocalTimer))
            .try_init(),
    };
    result.map_err(|e| Error::other(format!("Failed to initialize logging: {e}")))
}
