use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::http::{ensure_success, with_cancellation};
use super::{ClientError, JobDirectory};
use crate::model::{JobDescriptor, ResultToken};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextJobResponse {
    #[serde(default)]
    video_key: Option<JobDescriptor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultReport<'a> {
    #[serde(flatten)]
    job: &'a JobDescriptor,
    result_token: Option<&'a ResultToken>,
}

/// Job directory reached over HTTP.
///
/// `POST {base}/next` answers `{"videoKey": {...} | null}` (or 204), and
/// `POST {base}/result` accepts the job key plus `resultToken`.
#[derive(Debug, Clone)]
pub struct HttpJobDirectory {
    client: reqwest::Client,
    next_url: Url,
    result_url: Url,
}

impl HttpJobDirectory {
    pub fn new(client: reqwest::Client, base_url: &Url) -> Result<Self, ClientError> {
        Ok(Self {
            client,
            next_url: endpoint(base_url, "next")?,
            result_url: endpoint(base_url, "result")?,
        })
    }
}

/// Join `path` below `base`, keeping the base path even without a trailing slash.
fn endpoint(base: &Url, path: &str) -> Result<Url, ClientError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| ClientError::configuration(format!("invalid directory URL: {e}")))
}

#[async_trait]
impl JobDirectory for HttpJobDirectory {
    async fn next_job(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<JobDescriptor>, ClientError> {
        with_cancellation(token, async {
            let response = self.client.post(self.next_url.clone()).send().await?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let response = ensure_success(response, "next job")?;
            let body: NextJobResponse = response.json().await?;
            debug!(job = ?body.video_key, "Polled job directory");
            Ok(body.video_key)
        })
        .await
    }

    #[instrument(skip_all, fields(job = %job, success = result.is_some()))]
    async fn report_result(
        &self,
        job: &JobDescriptor,
        result: Option<&ResultToken>,
        token: &CancellationToken,
    ) -> Result<(), ClientError> {
        let report = ResultReport {
            job,
            result_token: result,
        };
        with_cancellation(token, async {
            let response = self
                .client
                .post(self.result_url.clone())
                .json(&report)
                .send()
                .await?;
            ensure_success(response, "report result")?;
            debug!("Result reported");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_base_path() {
        let base = Url::parse("http://directory.local/api/downloader").unwrap();
        assert_eq!(
            endpoint(&base, "next").unwrap().as_str(),
            "http://directory.local/api/downloader/next"
        );

        let base = Url::parse("http://directory.local/api/").unwrap();
        assert_eq!(
            endpoint(&base, "result").unwrap().as_str(),
            "http://directory.local/api/result"
        );
    }

    #[test]
    fn next_response_accepts_null_and_missing_key() {
        let body: NextJobResponse = serde_json::from_str(r#"{"videoKey":null}"#).unwrap();
        assert!(body.video_key.is_none());
        let body: NextJobResponse = serde_json::from_str("{}").unwrap();
        assert!(body.video_key.is_none());

        let body: NextJobResponse = serde_json::from_str(
            r#"{"videoKey":{"myAnimeListId":5,"dub":"Dub","episode":2}}"#,
        )
        .unwrap();
        assert_eq!(body.video_key, Some(JobDescriptor::new(5, "Dub", 2)));
    }

    #[test]
    fn report_flattens_job_key() {
        let job = JobDescriptor::new(5, "Dub", 2);
        let token = ResultToken::new("42");

        let ok = serde_json::to_value(ResultReport {
            job: &job,
            result_token: Some(&token),
        })
        .unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"myAnimeListId":5,"dub":"Dub","episode":2,"resultToken":"42"})
        );

        let failed = serde_json::to_value(ResultReport {
            job: &job,
            result_token: None,
        })
        .unwrap();
        assert_eq!(failed["resultToken"], serde_json::Value::Null);
    }
}
