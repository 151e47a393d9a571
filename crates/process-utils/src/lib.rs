//! Child-process helpers shared across the workspace.

use std::ffi::OsStr;
use std::process::ExitStatus;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// How a watched child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own. `code` is `None` when a signal terminated it.
    Exited { code: Option<i32>, success: bool },
    /// The process was killed after the cancellation token fired. `status` is
    /// what the reaped process reported, when it could be collected.
    Killed { status: Option<ExitStatus> },
    /// Waiting on the process failed.
    WaitFailed(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { success: true, .. })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

/// Spawn a task that waits for `child` to exit and reports how it ended.
///
/// If `cancellation_token` fires first, the process is killed, reaped, and
/// [`ProcessExit::Killed`] is sent with its final status.
pub fn spawn_process_waiter(
    mut child: Child,
    cancellation_token: CancellationToken,
) -> oneshot::Receiver<ProcessExit> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit = tokio::select! {
            _ = cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill process: {}", e);
                }
                let status = match child.wait().await {
                    Ok(status) => {
                        debug!(?status, code = ?status.code(), "Process killed");
                        Some(status)
                    }
                    Err(e) => {
                        warn!("Failed to reap killed process: {}", e);
                        None
                    }
                };
                ProcessExit::Killed { status }
            }
            status = child.wait() => {
                match status {
                    Ok(exit_status) => {
                        let code = exit_status.code();
                        if !exit_status.success() {
                            warn!("Process exited with code: {:?}", code);
                        }
                        ProcessExit::Exited { code, success: exit_status.success() }
                    }
                    Err(e) => {
                        error!("Error waiting for process: {}", e);
                        ProcessExit::WaitFailed(e.to_string())
                    }
                }
            }
        };
        let _ = tx.send(exit);
    });

    rx
}
