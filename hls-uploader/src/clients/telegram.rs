use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::http::{ensure_success, with_cancellation};
use super::{ClientError, UploadRequest, UploadSink};
use crate::model::ResultToken;

const SERVICE: &str = "telegram";

/// Uploads videos to a Telegram chat through the Bot API `sendVideo` method.
#[derive(Clone)]
pub struct TelegramUploadSink {
    client: reqwest::Client,
    send_video_url: Url,
    chat_id: String,
    timeout: Duration,
}

impl std::fmt::Debug for TelegramUploadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the URL embeds the bot token
        f.debug_struct("TelegramUploadSink")
            .field("chat_id", &self.chat_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramUploadSink {
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        bot_token: &str,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let send_video_url = Url::parse(api_url)
            .and_then(|base| base.join(&format!("./bot{bot_token}/sendVideo")))
            .map_err(|e| ClientError::configuration(format!("invalid Telegram API URL: {e}")))?;
        Ok(Self {
            client,
            send_video_url,
            chat_id: chat_id.into(),
            timeout,
        })
    }

    /// Download the cover image. Failures are logged and the upload goes on without it.
    async fn fetch_thumbnail(&self, url: &Url) -> Option<Part> {
        let fetched = async {
            let response = self.client.get(url.clone()).send().await?;
            let response = ensure_success(response, "thumbnail")?;
            Ok::<_, ClientError>(response.bytes().await?)
        }
        .await;

        match fetched {
            Ok(bytes) => Some(
                Part::stream(bytes)
                    .file_name("thumbnail.jpg")
                    .mime_str("image/jpeg")
                    .ok()?,
            ),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to fetch thumbnail, uploading without it");
                None
            }
        }
    }

    async fn build_form(&self, request: UploadRequest<'_>) -> Result<Form, ClientError> {
        let file = tokio::fs::File::open(request.path).await?;
        let length = file.metadata().await?.len();
        let file_name = request
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());

        let video = Part::stream_with_length(
            reqwest::Body::wrap_stream(ReaderStream::new(file)),
            length,
        )
        .file_name(file_name)
        .mime_str("video/mp4")?;

        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", request.caption.to_string())
            .text("width", request.info.width.to_string())
            .text("height", request.info.height.to_string())
            .text("duration", request.info.duration_secs.to_string())
            .text("supports_streaming", "true")
            .part("video", video);

        if let Some(url) = request.thumbnail
            && let Some(thumbnail) = self.fetch_thumbnail(url).await
        {
            form = form.part("thumbnail", thumbnail);
        }

        debug!(bytes = length, "Prepared upload form");
        Ok(form)
    }
}

fn parse_response(body: &[u8]) -> Result<ResultToken, ClientError> {
    let response: ApiResponse = serde_json::from_slice(body)
        .map_err(|e| ClientError::invalid_response(SERVICE, e.to_string()))?;
    if !response.ok {
        return Err(ClientError::Rejected {
            service: SERVICE,
            reason: response
                .description
                .unwrap_or_else(|| "no description".to_string()),
        });
    }
    response
        .result
        .map(|message| ResultToken::new(message.message_id.to_string()))
        .ok_or_else(|| ClientError::invalid_response(SERVICE, "missing result message"))
}

#[async_trait]
impl UploadSink for TelegramUploadSink {
    #[instrument(skip_all, fields(path = %request.path.display()))]
    async fn upload(
        &self,
        request: UploadRequest<'_>,
        token: &CancellationToken,
    ) -> Result<ResultToken, ClientError> {
        let form = self.build_form(request).await?;

        with_cancellation(token, async {
            let response = self
                .client
                .post(self.send_video_url.clone())
                .timeout(self.timeout)
                .multipart(form)
                .send()
                .await?;
            // Telegram reports API errors with a JSON body and a 4xx status
            let body = response.bytes().await?;
            let result = parse_response(&body)?;
            info!(message_id = %result, "Video uploaded");
            Ok(result)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::build_http_client;

    #[test]
    fn send_video_url_embeds_token() {
        let sink = TelegramUploadSink::new(
            build_http_client(None, Duration::ZERO).unwrap(),
            "https://api.telegram.org",
            "123:abc",
            "-100",
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(
            sink.send_video_url.as_str(),
            "https://api.telegram.org/bot123:abc/sendVideo"
        );
        assert!(!format!("{sink:?}").contains("123:abc"));
    }

    #[test]
    fn successful_response_yields_message_id() {
        let body = br#"{"ok":true,"result":{"message_id":4711,"chat":{"id":-100}}}"#;
        assert_eq!(parse_response(body).unwrap(), ResultToken::new("4711"));
    }

    #[test]
    fn api_error_is_rejected_with_description() {
        let body = br#"{"ok":false,"error_code":400,"description":"Bad Request: file too big"}"#;
        match parse_response(body) {
            Err(ClientError::Rejected { reason, .. }) => {
                assert!(reason.contains("file too big"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_invalid_response() {
        assert!(matches!(
            parse_response(b"<html>"),
            Err(ClientError::InvalidResponse { .. })
        ));
    }
}
