#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use hls_uploader::assembly::{
    AssemblyError, PlaylistResolver, ResolvedPlaylist, SegmentError, SegmentFetcher,
    VideoAssembler,
};
use hls_uploader::clients::{ClientError, UploadRequest, UploadSink};
use hls_uploader::config::{OUTPUT_PLACEHOLDER, RemuxConfig};
use hls_uploader::model::{JobDescriptor, ResultToken};
use hls_uploader::remux::{RemuxEngine, RemuxError};
use hls_uploader::scheduler::{JobExecutor, JobProcessor};

const FAKE_FFMPEG: &str = r#"cat > "$0"
echo 'Stream #0:0: Video: h264, yuv420p, 640x360' >&2
echo 'frame=  10 time=00:00:30.00 bitrate=1.0kbits/s' >&2
echo 'Stream #0:0: Video: h264, yuv420p, 1280x720' >&2
echo 'frame=  20 time=00:01:30.50 bitrate=1.0kbits/s' >&2"#;

struct FixedPlaylist {
    segments: Vec<Url>,
    thumbnail: Option<Url>,
}

impl FixedPlaylist {
    fn new(names: &[&str]) -> Self {
        Self {
            segments: names
                .iter()
                .map(|name| Url::parse(&format!("https://cdn.test/{name}")).unwrap())
                .collect(),
            thumbnail: Some(Url::parse("https://cdn.test/cover.jpg").unwrap()),
        }
    }
}

#[async_trait]
impl PlaylistResolver for FixedPlaylist {
    async fn resolve(
        &self,
        _job: &JobDescriptor,
        _token: &CancellationToken,
    ) -> Result<ResolvedPlaylist, ClientError> {
        Ok(ResolvedPlaylist {
            segments: self.segments.clone(),
            thumbnail: self.thumbnail.clone(),
        })
    }
}

/// Serves the segment name three times over, after a per-name delay.
/// Segments named `missing` fail.
struct DelayedFetcher {
    delays: Vec<(&'static str, u64)>,
}

#[async_trait]
impl SegmentFetcher for DelayedFetcher {
    async fn fetch(&self, url: &Url, _token: &CancellationToken) -> Result<Bytes, ClientError> {
        let name = url.path().trim_start_matches('/').to_string();
        if name == "missing" {
            return Err(ClientError::invalid_response("cdn", "segment not found"));
        }
        let delay = self
            .delays
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(0, |(_, ms)| *ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(Bytes::from(name.repeat(3)))
    }
}

/// Serves `size` zero bytes for every segment.
struct BulkFetcher {
    size: usize,
}

#[async_trait]
impl SegmentFetcher for BulkFetcher {
    async fn fetch(&self, _url: &Url, _token: &CancellationToken) -> Result<Bytes, ClientError> {
        Ok(Bytes::from(vec![0u8; self.size]))
    }
}

#[derive(Default)]
struct RecordingUploader {
    uploads: Mutex<Vec<Upload>>,
}

#[derive(Debug)]
struct Upload {
    path: PathBuf,
    content: Vec<u8>,
    caption: String,
    width: u32,
    height: u32,
    duration_secs: u32,
    thumbnail: Option<Url>,
}

#[async_trait]
impl UploadSink for RecordingUploader {
    async fn upload(
        &self,
        request: UploadRequest<'_>,
        _token: &CancellationToken,
    ) -> Result<ResultToken, ClientError> {
        let content = tokio::fs::read(request.path).await?;
        self.uploads.lock().push(Upload {
            path: request.path.to_path_buf(),
            content,
            caption: request.caption.to_string(),
            width: request.info.width,
            height: request.info.height,
            duration_secs: request.info.duration_secs,
            thumbnail: request.thumbnail.cloned(),
        });
        Ok(ResultToken::new("4711"))
    }
}

fn engine(dir: &Path) -> RemuxEngine {
    engine_running(dir, FAKE_FFMPEG)
}

fn engine_running(dir: &Path, script: &str) -> RemuxEngine {
    RemuxEngine::new(RemuxConfig {
        ffmpeg_path: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            script.to_string(),
            OUTPUT_PLACEHOLDER.to_string(),
        ],
        temp_dir: dir.to_path_buf(),
        file_pattern: "video-{id}.mp4".to_string(),
        pipe_capacity: 2,
    })
}

fn assembler(dir: &Path, names: &[&str]) -> VideoAssembler {
    VideoAssembler::new(
        Arc::new(FixedPlaylist::new(names)),
        Arc::new(DelayedFetcher {
            delays: vec![("A", 60), ("B", 5), ("C", 30)],
        }),
        engine(dir),
        3,
    )
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segments_reach_the_remuxer_in_playlist_order() {
    let dir = tempfile::tempdir().unwrap();
    let assembler = assembler(dir.path(), &["A", "B", "C"]);
    let job = JobDescriptor::new(52991, "Dub", 1);

    let video = assembler
        .assemble(&job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read(video.path()).unwrap(), b"AAABBBCCC");
    assert_eq!((video.info.width, video.info.height), (1280, 720));
    assert_eq!(video.info.duration_secs, 91);
    assert_eq!(
        video.thumbnail.as_ref().map(Url::as_str),
        Some("https://cdn.test/cover.jpg")
    );

    let path = video.path().to_path_buf();
    video.finish().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn failed_download_disposes_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let assembler = assembler(dir.path(), &["A", "missing", "C"]);

    let err = assembler
        .assemble(&JobDescriptor::new(1, "Dub", 1), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AssemblyError::Pipeline(e) => {
            assert_eq!(e.index(), Some(1));
            assert!(matches!(e.callback_error(), Some(SegmentError::Fetch(_))));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn remuxer_exiting_mid_input_reports_its_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..40).map(|i| format!("seg{i}.ts")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let assembler = VideoAssembler::new(
        Arc::new(FixedPlaylist::new(&names)),
        Arc::new(BulkFetcher { size: 256 * 1024 }),
        engine_running(
            dir.path(),
            "head -c 10 > /dev/null; echo 'Invalid data found when processing input' >&2; exit 1",
        ),
        3,
    );

    let err = assembler
        .assemble(&JobDescriptor::new(1, "Dub", 1), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AssemblyError::Remux(RemuxError::ProcessFailed { code, stderr_tail }) => {
            assert_eq!(code, Some(1));
            assert!(stderr_tail.contains("Invalid data found"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn duplicate_segments_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let assembler = assembler(dir.path(), &["A", "B", "A"]);

    let err = assembler
        .assemble(&JobDescriptor::new(1, "Dub", 1), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::Pipeline(_)));
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn empty_playlist_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let assembler = assembler(dir.path(), &[]);

    let err = assembler
        .assemble(&JobDescriptor::new(1, "Dub", 1), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::EmptyPlaylist));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processor_uploads_and_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = Arc::new(RecordingUploader::default());
    let processor = JobProcessor::new(assembler(dir.path(), &["A", "B", "C"]), uploader.clone());
    let job = JobDescriptor::new(52991, "Dub", 4);

    let result = processor
        .execute(&job, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result, ResultToken::new("4711"));

    let uploads = uploader.uploads.lock();
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert_eq!(upload.content, b"AAABBBCCC");
    assert_eq!(upload.caption, job.caption().unwrap());
    assert_eq!((upload.width, upload.height, upload.duration_secs), (1280, 720, 91));
    assert_eq!(
        upload.thumbnail.as_ref().map(Url::as_str),
        Some("https://cdn.test/cover.jpg")
    );
    assert!(!upload.path.exists());
}

#[tokio::test]
async fn cancelled_assembly_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let assembler = assembler(dir.path(), &["A", "B", "C"]);
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = assembler
        .assemble(&JobDescriptor::new(1, "Dub", 1), &token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "unexpected error: {err:?}");
    assert_eq!(files_in(dir.path()), 0);
}
