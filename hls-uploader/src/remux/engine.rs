use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use process_utils::{ProcessExit, spawn_process_waiter, tokio_command};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::diagnostics;
use super::error::RemuxError;
use crate::config::{OUTPUT_PLACEHOLDER, RemuxConfig};

const ID_PLACEHOLDER: &str = "{id}";
const STDERR_TAIL_LINES: usize = 20;

/// Result of a successful remux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub duration_secs: u32,
}

/// Lifecycle of a [`RemuxSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The process is alive and the input pipe may be open.
    Running,
    /// The process has exited and its tasks were joined. The temp file is
    /// still on disk.
    Exited,
    /// The process is gone and the temp file was removed.
    Disposed,
}

/// Spawns remux sessions from a shared configuration.
#[derive(Debug, Clone)]
pub struct RemuxEngine {
    config: Arc<RemuxConfig>,
}

impl RemuxEngine {
    pub fn new(config: RemuxConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RemuxConfig {
        &self.config
    }

    /// Temp file path for a session id.
    pub fn output_path(&self, id: &str) -> PathBuf {
        self.config
            .temp_dir
            .join(self.config.file_pattern.replace(ID_PLACEHOLDER, id))
    }

    fn build_args(&self, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }

    /// Start a session writing to a fresh temp file.
    pub async fn start(&self, token: &CancellationToken) -> Result<RemuxSession, RemuxError> {
        let id = Uuid::new_v4().to_string();
        self.start_with_id(&id, token).await
    }

    /// Start a session whose output file is derived from `id`.
    ///
    /// The process is killed as soon as `token` (or the session itself) is
    /// cancelled.
    pub async fn start_with_id(
        &self,
        id: &str,
        token: &CancellationToken,
    ) -> Result<RemuxSession, RemuxError> {
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| RemuxError::io("creating temp directory", e))?;

        let output_path = self.output_path(id);
        let args = self.build_args(&output_path);

        info!(path = %output_path.display(), "Starting remux process");
        debug!(program = %self.config.ffmpeg_path, ?args, "Remux command");

        let mut child = tokio_command(&self.config.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RemuxError::Spawn {
                program: self.config.ffmpeg_path.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RemuxError::MissingPipe("stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(RemuxError::MissingPipe("stderr"))?;

        let session_token = token.child_token();
        let diagnostics = Arc::new(Mutex::new(String::new()));
        let (input_tx, input_rx) = mpsc::channel(self.config.pipe_capacity.max(1));

        let pump = tokio::spawn(pump_input(input_rx, stdin, session_token.clone()));
        let reader = tokio::spawn(collect_diagnostics(stderr, diagnostics.clone()));
        let exit = spawn_process_waiter(child, session_token.clone());

        Ok(RemuxSession {
            output_path,
            state: SessionState::Running,
            input: Some(SegmentSink { tx: input_tx }),
            token: session_token,
            diagnostics,
            pump: Some(pump),
            reader: Some(reader),
            exit: Some(exit),
        })
    }
}

/// Write end of a session's input pipe.
#[derive(Debug)]
pub struct SegmentSink {
    tx: mpsc::Sender<Bytes>,
}

impl SegmentSink {
    /// Queue a chunk for the remux process, waiting while the pipe is full.
    pub async fn write(&self, chunk: Bytes) -> Result<(), RemuxError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| RemuxError::InputClosed)
    }
}

/// A running remux process plus the tasks feeding and observing it.
///
/// Call [`dispose`](Self::dispose) when done. Dropping an undisposed session
/// kills the process and removes the temp file in the background.
#[derive(Debug)]
pub struct RemuxSession {
    output_path: PathBuf,
    state: SessionState,
    input: Option<SegmentSink>,
    token: CancellationToken,
    diagnostics: Arc<Mutex<String>>,
    pump: Option<JoinHandle<io::Result<u64>>>,
    reader: Option<JoinHandle<()>>,
    exit: Option<oneshot::Receiver<ProcessExit>>,
}

impl RemuxSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn input(&self) -> Result<&SegmentSink, RemuxError> {
        self.input
            .as_ref()
            .ok_or(RemuxError::InvalidState { state: self.state })
    }

    /// Close the input, wait for the process to finish and parse its output.
    ///
    /// Cancelling `token` kills the process and returns [`RemuxError::Cancelled`].
    pub async fn complete(&mut self, token: &CancellationToken) -> Result<VideoInfo, RemuxError> {
        if self.state != SessionState::Running {
            return Err(RemuxError::InvalidState { state: self.state });
        }
        self.input = None;

        let (pumped, exit) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.token.cancel();
                return Err(RemuxError::Cancelled);
            }
            result = self.wait_for_exit() => result,
        };
        self.state = SessionState::Exited;

        if let Some(err) = self.exit_error(exit) {
            return Err(err);
        }

        let written = match pumped {
            Some(Ok(written)) => written,
            Some(Err(e)) => return Err(RemuxError::io("writing remux input", e)),
            None => 0,
        };

        let parsed = diagnostics::parse(&self.diagnostics.lock())?;
        info!(
            bytes = written,
            width = parsed.width,
            height = parsed.height,
            duration = parsed.duration_secs,
            "Remux finished"
        );

        Ok(VideoInfo {
            path: self.output_path.clone(),
            width: parsed.width,
            height: parsed.height,
            duration_secs: parsed.duration_secs,
        })
    }

    /// Find out why the input pipe closed before the input was complete.
    ///
    /// Joins the process and returns its failure. `None` means the process
    /// exited cleanly without taking all of the input.
    pub async fn input_closed_cause(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Option<RemuxError>, RemuxError> {
        if self.state != SessionState::Running {
            return Err(RemuxError::InvalidState { state: self.state });
        }
        self.input = None;

        let (pumped, exit) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.token.cancel();
                return Err(RemuxError::Cancelled);
            }
            result = self.wait_for_exit() => result,
        };
        self.state = SessionState::Exited;

        if let Some(Err(e)) = &pumped {
            debug!(error = %e, "Remux input pump stopped early");
        }
        Ok(self.exit_error(exit))
    }

    fn exit_error(&self, exit: ProcessExit) -> Option<RemuxError> {
        match exit {
            ProcessExit::Exited { success: true, .. } => None,
            ProcessExit::Exited { code, .. } => Some(RemuxError::ProcessFailed {
                code,
                stderr_tail: self.stderr_tail(),
            }),
            ProcessExit::Killed { status } => {
                debug!(?status, "Remux process was killed");
                Some(RemuxError::ProcessKilled)
            }
            ProcessExit::WaitFailed(reason) => Some(RemuxError::Wait { reason }),
        }
    }

    /// Stop the process if still running, wait for the pump and the diagnostics
    /// reader, then delete the temp file. Safe to call more than once.
    pub async fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        debug!(path = %self.output_path.display(), "Disposing remux session");

        self.input = None;
        self.token.cancel();
        let _ = self.wait_for_exit().await;
        remove_output(&self.output_path).await;

        self.state = SessionState::Disposed;
    }

    /// Join pump, process and diagnostics reader, in that order.
    ///
    /// Handles are cleared only after they resolve, so an interrupted call can
    /// be resumed by `dispose`.
    async fn wait_for_exit(&mut self) -> (Option<io::Result<u64>>, ProcessExit) {
        let pumped = match self.pump.as_mut() {
            Some(handle) => {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));
                self.pump = None;
                Some(result)
            }
            None => None,
        };

        let exit = match self.exit.as_mut() {
            Some(rx) => {
                let exit = rx
                    .await
                    .unwrap_or_else(|_| ProcessExit::WaitFailed("process waiter dropped".into()));
                self.exit = None;
                exit
            }
            None => ProcessExit::WaitFailed("process already reaped".into()),
        };

        if let Some(handle) = self.reader.as_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Remux diagnostics reader failed");
            }
            self.reader = None;
        }

        (pumped, exit)
    }

    fn stderr_tail(&self) -> String {
        let output = self.diagnostics.lock();
        let lines: Vec<&str> = output.lines().collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

impl Drop for RemuxSession {
    fn drop(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.token.cancel();

        let pump = self.pump.take();
        let exit = self.exit.take();
        let reader = self.reader.take();
        let path = self.output_path.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(pump) = pump {
                        let _ = pump.await;
                    }
                    if let Some(exit) = exit {
                        let _ = exit.await;
                    }
                    if let Some(reader) = reader {
                        let _ = reader.await;
                    }
                    remove_output(&path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

async fn pump_input(
    mut rx: mpsc::Receiver<Bytes>,
    mut stdin: ChildStdin,
    token: CancellationToken,
) -> io::Result<u64> {
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(io::Error::new(io::ErrorKind::Interrupted, "remux input cancelled")),
            chunk = rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(io::Error::new(io::ErrorKind::Interrupted, "remux input cancelled")),
            result = stdin.write_all(&chunk) => result?,
        }
        written += chunk.len() as u64;
        trace!(chunk = chunk.len(), written, "Piped chunk to remux process");
    }
    stdin.shutdown().await?;
    Ok(written)
}

async fn collect_diagnostics(stderr: ChildStderr, buffer: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                trace!(target: "hls_uploader::ffmpeg", "{}", text.trim_end());
                buffer.lock().push_str(&text);
            }
            Err(e) => {
                warn!(error = %e, "Error reading remux output");
                break;
            }
        }
    }
}

async fn remove_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    const FAKE_FFMPEG: &str = r#"cat > "$0"
echo 'Stream #0:0: Video: h264, yuv420p, 640x360' >&2
echo 'frame=  10 time=00:00:30.00 bitrate=1.0kbits/s' >&2
echo 'Stream #0:0: Video: h264, yuv420p, 1280x720' >&2
echo 'frame=  20 time=00:01:30.50 bitrate=1.0kbits/s' >&2"#;

    fn engine(dir: &Path, script: &str) -> RemuxEngine {
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

    #[tokio::test]
    async fn complete_writes_input_and_parses_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), FAKE_FFMPEG);
        let token = CancellationToken::new();

        let mut session = engine.start_with_id("abc", &token).await.unwrap();
        assert_eq!(session.output_path(), dir.path().join("video-abc.mp4"));

        let sink = session.input().unwrap();
        sink.write(Bytes::from_static(b"AAA")).await.unwrap();
        sink.write(Bytes::from_static(b"BBB")).await.unwrap();

        let info = session.complete(&token).await.unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.duration_secs, 91);
        assert_eq!(std::fs::read(&info.path).unwrap(), b"AAABBB");
        assert_eq!(session.state(), SessionState::Exited);

        session.dispose().await;
        assert!(!info.path.exists());
        assert_eq!(session.state(), SessionState::Disposed);

        // second dispose is a no-op
        session.dispose().await;
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_output_tail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "cat > /dev/null; echo 'Invalid data found' >&2; exit 1");
        let token = CancellationToken::new();

        let mut session = engine.start(&token).await.unwrap();
        let err = session.complete(&token).await.unwrap_err();

        match err {
            RemuxError::ProcessFailed { code, stderr_tail } => {
                assert_eq!(code, Some(1));
                assert!(stderr_tail.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        session.dispose().await;
    }

    #[tokio::test]
    async fn early_exit_closes_input_and_reports_the_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            "head -c 10 > /dev/null; echo 'Invalid data found' >&2; exit 1",
        );
        let token = CancellationToken::new();

        let mut session = engine.start(&token).await.unwrap();
        let sink = session.input().unwrap();
        let chunk = Bytes::from(vec![0u8; 256 * 1024]);
        let mut closed = false;
        for _ in 0..64 {
            if let Err(e) = sink.write(chunk.clone()).await {
                assert!(matches!(e, RemuxError::InputClosed));
                closed = true;
                break;
            }
        }
        assert!(closed);

        let cause = session.input_closed_cause(&token).await.unwrap();
        match cause {
            Some(RemuxError::ProcessFailed { code, stderr_tail }) => {
                assert_eq!(code, Some(1));
                assert!(stderr_tail.contains("Invalid data found"));
            }
            other => panic!("unexpected cause: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Exited);
        session.dispose().await;
    }

    #[tokio::test]
    async fn missing_markers_fail_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), r#"cat > "$0"; echo 'time=00:00:05.00' >&2"#);
        let token = CancellationToken::new();

        let mut session = engine.start(&token).await.unwrap();
        let err = session.complete(&token).await.unwrap_err();

        assert!(matches!(
            err,
            RemuxError::Parse(diagnostics::DiagnosticsError::MissingResolution)
        ));
        session.dispose().await;
    }

    #[tokio::test]
    async fn cancellation_mid_write_leaves_no_file_after_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), r#"exec cat > "$0""#);
        let token = CancellationToken::new();

        let mut session = engine.start_with_id("cancel", &token).await.unwrap();
        let path = session.output_path().to_path_buf();
        session
            .input()
            .unwrap()
            .write(Bytes::from_static(b"partial"))
            .await
            .unwrap();

        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        token.cancel();
        let err = session.complete(&token).await.unwrap_err();
        assert!(err.is_cancellation());

        session.dispose().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn complete_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), FAKE_FFMPEG);
        let token = CancellationToken::new();

        let mut session = engine.start(&token).await.unwrap();
        session.complete(&token).await.unwrap();

        let err = session.complete(&token).await.unwrap_err();
        assert!(matches!(
            err,
            RemuxError::InvalidState {
                state: SessionState::Exited
            }
        ));
        assert!(matches!(
            session.input(),
            Err(RemuxError::InvalidState { .. })
        ));
        session.dispose().await;
    }

    #[tokio::test]
    async fn dropping_a_session_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), FAKE_FFMPEG);
        let token = CancellationToken::new();

        let mut session = engine.start_with_id("dropped", &token).await.unwrap();
        let info = session.complete(&token).await.unwrap();
        assert!(info.path.exists());
        drop(session);

        for _ in 0..200 {
            if !info.path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!info.path.exists());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RemuxConfig {
            temp_dir: dir.path().to_path_buf(),
            ..RemuxConfig::default()
        };
        config.ffmpeg_path = "/nonexistent/ffmpeg-binary".to_string();
        let engine = RemuxEngine::new(config);

        let err = engine.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RemuxError::Spawn { .. }));
    }
}
