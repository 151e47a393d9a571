//! Worker configuration loaded from TOML with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::logging::LogFormat;
use crate::{Error, Result};

pub const ENV_TELEGRAM_BOT_TOKEN: &str = "HLS_UPLOADER_TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "HLS_UPLOADER_TELEGRAM_CHAT_ID";
pub const ENV_DIRECTORY_URL: &str = "HLS_UPLOADER_DIRECTORY_URL";
pub const ENV_NOTIFICATION_URL: &str = "HLS_UPLOADER_NOTIFICATION_URL";
pub const ENV_SOURCE_URL: &str = "HLS_UPLOADER_SOURCE_URL";
pub const ENV_FFMPEG_PATH: &str = "FFMPEG_PATH";

/// Placeholder replaced by the temp output path in remux arguments.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub processing: ProcessingConfig,
    pub download: DownloadConfig,
    pub remux: RemuxConfig,
    pub directory: DirectoryConfig,
    pub notification: NotificationConfig,
    pub source: SourceConfig,
    pub telegram: TelegramConfig,
    pub logging: LoggingConfig,
}

/// Worker pool and job lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of jobs processed concurrently.
    pub workers: usize,
    /// Upper bound for a single job, assembly and upload included.
    pub job_timeout_secs: u64,
    /// Consecutive failures that stop the worker pool.
    pub max_sequential_failures: usize,
    /// Deadline for reporting a job result, independent of the job itself.
    pub report_timeout_secs: u64,
    /// Pause after a failed job-directory poll.
    pub poll_error_backoff_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            job_timeout_secs: 300,
            max_sequential_failures: 3,
            report_timeout_secs: 30,
            poll_error_backoff_secs: 5,
        }
    }
}

impl ProcessingConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_error_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Segments downloaded in parallel per job.
    pub concurrent_downloads: usize,
    /// Retries per segment after the first attempt.
    pub segment_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: Option<String>,
    /// Pick the lowest quality variant instead of the highest.
    pub use_lowest_quality: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: 4,
            segment_retries: 2,
            retry_base_delay_ms: 500,
            request_timeout_secs: 60,
            user_agent: None,
            use_lowest_quality: false,
        }
    }
}

impl DownloadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// External remux program settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    pub ffmpeg_path: String,
    /// Program arguments; `{output}` is replaced with the temp file path.
    pub args: Vec<String>,
    pub temp_dir: PathBuf,
    /// Temp file name; `{id}` is replaced with a per-job id.
    pub file_pattern: String,
    /// Segments buffered between the downloader and the program's stdin.
    pub pipe_capacity: usize,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            args: [
                "-hide_banner",
                "-i",
                "pipe:0",
                "-f",
                "mp4",
                "-c",
                "copy",
                "-y",
                OUTPUT_PLACEHOLDER,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            temp_dir: std::env::temp_dir().join("hls-uploader"),
            file_pattern: "video-{id}.mp4".to_string(),
            pipe_capacity: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub base_url: Option<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub url: Option<Url>,
    /// Long-poll wait requested from the notification endpoint.
    pub wait_time_secs: u64,
    pub error_retry_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            url: None,
            wait_time_secs: 20,
            error_retry_secs: 5,
        }
    }
}

impl NotificationConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn error_retry(&self) -> Duration {
        Duration::from_secs(self.error_retry_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: Option<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_url: String,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            bot_token: None,
            chat_id: None,
            timeout_secs: 600,
        }
    }
}

impl TelegramConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when neither the CLI nor `RUST_LOG` set one.
    pub filter: Option<String>,
    pub format: LogFormat,
}

impl AppConfig {
    /// Load configuration from `path` (defaults when the file is missing), then
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid configuration: {e}")))
    }

    /// Overlay values found through `lookup` (normally the process environment).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(token) = non_empty(ENV_TELEGRAM_BOT_TOKEN) {
            self.telegram.bot_token = Some(token);
        }
        if let Some(chat_id) = non_empty(ENV_TELEGRAM_CHAT_ID) {
            self.telegram.chat_id = Some(chat_id);
        }
        if let Some(path) = non_empty(ENV_FFMPEG_PATH) {
            self.remux.ffmpeg_path = path;
        }

        let url_override = |key: &str, target: &mut Option<Url>| {
            if let Some(raw) = non_empty(key) {
                match Url::parse(&raw) {
                    Ok(url) => *target = Some(url),
                    Err(e) => tracing::warn!(key, error = %e, "Ignoring invalid URL override"),
                }
            }
        };
        url_override(ENV_DIRECTORY_URL, &mut self.directory.base_url);
        url_override(ENV_NOTIFICATION_URL, &mut self.notification.url);
        url_override(ENV_SOURCE_URL, &mut self.source.base_url);
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.processing.workers == 0 {
            return Err(Error::config("processing.workers must be at least 1"));
        }
        if self.processing.max_sequential_failures == 0 {
            return Err(Error::config(
                "processing.max_sequential_failures must be at least 1",
            ));
        }
        if self.download.concurrent_downloads == 0 {
            return Err(Error::config(
                "download.concurrent_downloads must be at least 1",
            ));
        }
        if !self.remux.args.iter().any(|arg| arg.contains(OUTPUT_PLACEHOLDER)) {
            return Err(Error::config(format!(
                "remux.args must contain the {OUTPUT_PLACEHOLDER} placeholder"
            )));
        }
        if self.directory.base_url.is_none() {
            return Err(Error::config("directory.base_url is required"));
        }
        if self.notification.url.is_none() {
            return Err(Error::config("notification.url is required"));
        }
        if self.source.base_url.is_none() {
            return Err(Error::config("source.base_url is required"));
        }
        if Url::parse(&self.telegram.api_url).is_err() {
            return Err(Error::config(format!(
                "telegram.api_url is not a valid URL: {}",
                self.telegram.api_url
            )));
        }
        if self.telegram.bot_token.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(format!(
                "telegram.bot_token is required (or set {ENV_TELEGRAM_BOT_TOKEN})"
            )));
        }
        if self.telegram.chat_id.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(format!(
                "telegram.chat_id is required (or set {ENV_TELEGRAM_CHAT_ID})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn complete_config() -> AppConfig {
        AppConfig::from_toml(
            r#"
            [directory]
            base_url = "http://directory.local/api"

            [notification]
            url = "http://notify.local/wait"

            [source]
            base_url = "http://source.local"

            [telegram]
            bot_token = "123:abc"
            chat_id = "-100200"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();

        assert_eq!(config.processing.workers, 1);
        assert_eq!(config.processing.job_timeout(), Duration::from_secs(300));
        assert_eq!(config.processing.max_sequential_failures, 3);
        assert_eq!(config.download.concurrent_downloads, 4);
        assert_eq!(config.remux.ffmpeg_path, "ffmpeg");
        assert_eq!(config.remux.file_pattern, "video-{id}.mp4");
        assert!(config.remux.args.iter().any(|a| a == OUTPUT_PLACEHOLDER));
        assert_eq!(config.telegram.api_url, "https://api.telegram.org");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let config = AppConfig::from_toml(
            r#"
            [processing]
            workers = 3

            [download]
            use_lowest_quality = true
            "#,
        )
        .unwrap();

        assert_eq!(config.processing.workers, 3);
        assert_eq!(config.processing.job_timeout_secs, 300);
        assert!(config.download.use_lowest_quality);
        assert_eq!(config.download.segment_retries, 2);
    }

    #[test]
    fn complete_config_validates() {
        complete_config().validate().unwrap();
    }

    #[test]
    fn validation_rejects_zero_workers() {
        let mut config = complete_config();
        config.processing.workers = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn validation_requires_output_placeholder() {
        let mut config = complete_config();
        config.remux.args = vec!["-i".into(), "pipe:0".into(), "out.mp4".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("{output}"));
    }

    #[test]
    fn validation_requires_credentials() {
        let mut config = complete_config();
        config.telegram.bot_token = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_TELEGRAM_BOT_TOKEN, "999:env"),
            (ENV_SOURCE_URL, "http://env-source.local"),
            (ENV_NOTIFICATION_URL, "not a url"),
            (ENV_FFMPEG_PATH, "   "),
        ]);
        let mut config = complete_config();

        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.telegram.bot_token.as_deref(), Some("999:env"));
        assert_eq!(
            config.source.base_url.as_ref().map(Url::as_str),
            Some("http://env-source.local/")
        );
        // invalid and blank overrides are ignored
        assert_eq!(
            config.notification.url.as_ref().map(Url::as_str),
            Some("http://notify.local/wait")
        );
        assert_eq!(config.remux.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.processing.workers, 1);
    }
}
